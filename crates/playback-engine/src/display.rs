//! Presentation stage: paced video output and the host-pulled audio path.
//!
//! Video runs on its own thread and sleeps against the [`SyncClock`] before handing
//! each picture to the renderer. Audio is pulled by the host device: each
//! [`DisplayController::fill_audio`] call drains decoded frames into the requested
//! block and carries whatever does not fit over to the next call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::SyncClock;
use crate::config::PlaneCrop;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::frame::{AudioFormat, DecodedFrame, PixelFormat, TimeBase, VideoFrame};
use crate::gate::Gate;
use crate::media::{AudioResampler, VideoPicture, VideoRenderer};
use crate::queue::BoundedQueue;

/// Audio left over from the last frame that did not fit the previous request.
#[derive(Default)]
struct RemainderBuffer {
    data: Vec<u8>,
    read_index: usize,
}

impl RemainderBuffer {
    fn unread(&self) -> &[u8] {
        &self.data[self.read_index..]
    }

    fn consume(&mut self, n: usize) {
        self.read_index += n;
        if self.read_index >= self.data.len() {
            self.clear();
        }
    }

    /// Replace the contents, reusing the allocation.
    fn store(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.read_index = 0;
    }

    fn clear(&mut self) {
        self.data.clear();
        self.read_index = 0;
    }
}

struct AudioPath {
    resampler: Option<Box<dyn AudioResampler>>,
    remainder: RemainderBuffer,
    scratch: Vec<u8>,
}

#[derive(Clone, Copy)]
struct LastPresented {
    pts: i64,
    time_base: TimeBase,
}

pub struct VideoOutput {
    pub frames: Arc<BoundedQueue<DecodedFrame>>,
    pub renderer: Arc<dyn VideoRenderer>,
}

pub struct AudioOutput {
    pub frames: Arc<BoundedQueue<DecodedFrame>>,
    /// Format adopted by the host device.
    pub format: AudioFormat,
    /// Converter from the stream format; `None` passes decoded bytes through.
    pub resampler: Option<Box<dyn AudioResampler>>,
}

pub struct DisplayController {
    should_display: AtomicBool,
    paused: AtomicBool,
    /// Open while not paused.
    pause_gate: Gate,
    /// Opened by `stop_display` to cut pacing sleeps short.
    stop_gate: Gate,
    /// Open while video is selected for presentation.
    video_gate: Gate,
    /// Open while no audio fill is in progress.
    fill_idle: Gate,
    clock: Arc<SyncClock>,
    video: Option<VideoOutput>,
    audio_frames: Option<Arc<BoundedQueue<DecodedFrame>>>,
    output_format: Option<AudioFormat>,
    audio: Mutex<AudioPath>,
    flush_generation: AtomicU64,
    last_presented: Mutex<Option<LastPresented>>,
    min_exec_time: Duration,
    crop: HashMap<PixelFormat, PlaneCrop>,
    video_thread: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl DisplayController {
    pub fn new(
        clock: Arc<SyncClock>,
        video: Option<VideoOutput>,
        audio: Option<AudioOutput>,
        min_exec_time: Duration,
        crop: HashMap<PixelFormat, PlaneCrop>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let (audio_frames, output_format, resampler) = match audio {
            Some(a) => (Some(a.frames), Some(a.format), a.resampler),
            None => (None, None, None),
        };
        Self {
            should_display: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pause_gate: Gate::new(true),
            stop_gate: Gate::new(false),
            video_gate: Gate::new(true),
            fill_idle: Gate::new(true),
            clock,
            video,
            audio_frames,
            output_format,
            audio: Mutex::new(AudioPath {
                resampler,
                remainder: RemainderBuffer::default(),
                scratch: Vec::new(),
            }),
            flush_generation: AtomicU64::new(0),
            last_presented: Mutex::new(None),
            min_exec_time,
            crop,
            video_thread: Mutex::new(None),
            diagnostics,
        }
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.output_format
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_displaying(&self) -> bool {
        self.should_display.load(Ordering::Acquire)
    }

    /// Begin presenting. Spawns the video pacing thread when video is wired up.
    pub fn start_display(self: &Arc<Self>) -> Result<()> {
        self.should_display.store(true, Ordering::Release);
        self.stop_gate.close();
        if self.video.is_none() {
            return Ok(());
        }
        let mut slot = lock(&self.video_thread);
        if slot.is_some() {
            return Ok(());
        }
        let display = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("display-video".into())
            .spawn(move || display.video_loop())?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop_display(&self) {
        self.should_display.store(false, Ordering::Release);
        self.stop_gate.open();
        self.pause_gate.open();
        self.video_gate.open();
    }

    /// Park or release the video thread when video is (de)selected.
    pub fn set_video_selected(&self, selected: bool) {
        self.video_gate.set(selected);
        // A stop racing with the close must still release the thread.
        if !selected && self.stop_gate.is_open() {
            self.video_gate.open();
        }
    }

    /// Toggle pacing. Entering pause drops the clock anchor.
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if paused {
            self.clock.reset();
            self.pause_gate.close();
        } else {
            self.pause_gate.open();
        }
    }

    /// Drop carried-over audio and any input buffered by the resampler.
    pub fn flush(&self) {
        self.flush_generation.fetch_add(1, Ordering::AcqRel);
        let mut audio = lock(&self.audio);
        audio.remainder.clear();
        if let Some(resampler) = audio.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Media time of the last frame presented on the master stream, if any.
    pub fn play_time(&self) -> Option<f64> {
        lock(&self.last_presented).map(|last| last.time_base.seconds(last.pts))
    }

    pub fn reset_play_time(&self) {
        *lock(&self.last_presented) = None;
    }

    /// Stop presenting and wait for the video thread and any in-flight fill.
    pub fn free_resources(&self) {
        self.stop_display();
        let handle = lock(&self.video_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("display thread panicked");
            }
        }
        self.fill_idle.wait();
        self.flush();
        self.reset_play_time();
    }

    fn video_loop(&self) {
        let Some(video) = &self.video else {
            return;
        };
        tracing::debug!("video display thread started");

        while self.is_displaying() {
            if self.is_paused() {
                self.pause_gate.wait();
                continue;
            }
            if !self.video_gate.is_open() {
                self.video_gate.wait();
                continue;
            }

            let Some(frame) = video.frames.blocking_remove() else {
                if !video.frames.io_enabled() && self.is_displaying() {
                    // Queue is mid-flush; give the flush a moment instead of spinning.
                    self.stop_gate.wait_timeout(self.min_exec_time);
                }
                continue;
            };
            let DecodedFrame::Video(frame) = frame else {
                continue;
            };

            let remain = self.clock.remain_time_for_video(frame.pts, frame.time_base);
            let min = self.min_exec_time.as_secs_f64();
            if remain > min {
                if self.stop_gate.wait_timeout(Duration::from_secs_f64(remain)) {
                    break;
                }
            } else if remain < -min {
                tracing::trace!(pts = frame.pts, remain, "late video frame dropped");
                self.diagnostics.time_mark("video dropped");
                continue;
            }

            if !self.is_displaying() {
                break;
            }
            self.present_video(&video.renderer, &frame);
        }
        tracing::debug!("video display thread exiting");
    }

    fn present_video(&self, renderer: &Arc<dyn VideoRenderer>, frame: &VideoFrame) {
        let crop = self.crop.get(&frame.format).copied().unwrap_or_default();
        let Some(picture) = picture_from_frame(frame, crop) else {
            tracing::warn!(pts = frame.pts, "video frame planes out of range; dropped");
            return;
        };
        renderer.present(&picture);
        self.diagnostics.time_mark("video present");

        if !self.clock.master_is_audio() {
            *lock(&self.last_presented) = Some(LastPresented {
                pts: frame.pts,
                time_base: frame.time_base,
            });
        }
        if !self.is_paused() {
            self.clock.present_video(frame.pts, frame.time_base);
        }
    }

    /// Fill `buf` with audio in [`Self::output_format`].
    ///
    /// Always writes the whole buffer; silence pads whatever real audio could not
    /// cover. Returns the number of real audio bytes written.
    pub fn fill_audio(&self, buf: &mut [u8]) -> usize {
        let Some(frames) = &self.audio_frames else {
            buf.fill(0);
            return 0;
        };
        if !self.is_displaying() || self.is_paused() {
            buf.fill(0);
            return 0;
        }

        self.fill_idle.close();
        let filled = self.fill_from_frames(frames, buf);
        self.fill_idle.open();

        buf[filled..].fill(0);
        filled
    }

    fn fill_from_frames(&self, frames: &BoundedQueue<DecodedFrame>, buf: &mut [u8]) -> usize {
        let generation = self.flush_generation.load(Ordering::Acquire);
        let mut filled = {
            let mut audio = lock(&self.audio);
            let unread = audio.remainder.unread();
            let n = unread.len().min(buf.len());
            buf[..n].copy_from_slice(&unread[..n]);
            audio.remainder.consume(n);
            n
        };

        let min = self.min_exec_time.as_secs_f64();
        while filled < buf.len() {
            if self.is_paused() || !self.is_displaying() {
                break;
            }
            let Some(frame) = frames.blocking_remove() else {
                break;
            };
            let DecodedFrame::Audio(frame) = frame else {
                continue;
            };

            let remain = self.clock.remain_time_for_audio(frame.pts, frame.time_base);
            if remain < -min {
                tracing::trace!(pts = frame.pts, remain, "late audio frame dropped");
                continue;
            }

            let mut audio = lock(&self.audio);
            if self.flush_generation.load(Ordering::Acquire) != generation {
                // Flushed underneath us; this frame predates the flush.
                break;
            }
            let AudioPath {
                resampler,
                remainder,
                scratch,
            } = &mut *audio;

            let data: &[u8] = match resampler.as_mut() {
                Some(r) if r.needs_resample(&frame) => {
                    scratch.clear();
                    if let Err(e) = r.resample(&frame, scratch) {
                        tracing::warn!(pts = frame.pts, error = %format!("{e:#}"), "resample failed");
                        continue;
                    }
                    scratch.as_slice()
                }
                _ => frame.data(),
            };
            if data.is_empty() {
                continue;
            }

            let pre_buffer = self
                .output_format
                .map(|f| f.duration_of(filled))
                .unwrap_or_default();
            if self.clock.master_is_audio() {
                *lock(&self.last_presented) = Some(LastPresented {
                    pts: frame.pts,
                    time_base: frame.time_base,
                });
            }
            if !self.is_paused() {
                self.clock.present_audio(
                    frame.pts,
                    frame.time_base,
                    Duration::from_secs_f64(pre_buffer),
                );
            }

            let n = data.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&data[..n]);
            filled += n;
            if n < data.len() {
                remainder.store(&data[n..]);
            }
        }
        filled
    }
}

/// Borrowed picture for `frame` with `crop` rows removed.
fn picture_from_frame(frame: &VideoFrame, crop: PlaneCrop) -> Option<VideoPicture<'_>> {
    let cut = crop.top_rows + crop.bottom_rows;
    if cut >= frame.height {
        return None;
    }
    let height = frame.height as usize;
    let mut planes = Vec::with_capacity(frame.planes.len());
    let mut strides = Vec::with_capacity(frame.planes.len());
    for (i, layout) in frame.planes.iter().enumerate() {
        let bytes = frame.plane(i)?;
        // Subsampled planes lose proportionally fewer rows.
        let top = crop.top_rows as usize * layout.rows / height;
        let bottom = crop.bottom_rows as usize * layout.rows / height;
        let start = top * layout.stride;
        let end = layout.rows.saturating_sub(bottom) * layout.stride;
        planes.push(bytes.get(start..end)?);
        strides.push(layout.stride);
    }
    Some(VideoPicture {
        planes,
        strides,
        width: frame.width,
        height: frame.height - cut,
        format: frame.format,
        pts_secs: frame.time_base.seconds(frame.pts),
    })
}

/// Host-side handle for the audio device callback.
///
/// Stays valid across opens of the owning session; while nothing is playing it
/// produces silence.
#[derive(Clone, Default)]
pub struct AudioPull {
    display: Arc<RwLock<Option<Arc<DisplayController>>>>,
}

impl AudioPull {
    pub(crate) fn attach(&self, display: Option<Arc<DisplayController>>) {
        *self.display.write().unwrap_or_else(PoisonError::into_inner) = display;
    }

    fn current(&self) -> Option<Arc<DisplayController>> {
        self.display
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fill `buf` with the next block of audio (see [`DisplayController::fill_audio`]).
    pub fn fill(&self, buf: &mut [u8]) -> usize {
        match self.current() {
            Some(display) => display.fill_audio(buf),
            None => {
                buf.fill(0);
                0
            }
        }
    }

    /// Format the bytes produced by [`Self::fill`] are in.
    pub fn output_format(&self) -> Option<AudioFormat> {
        self.current().and_then(|d| d.output_format())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
