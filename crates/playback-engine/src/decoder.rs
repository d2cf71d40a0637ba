//! Per-stream decode stage.
//!
//! A [`DecoderUnit`] owns the packet queue fed by the read thread, the frame queue
//! drained by the display, and one worker thread turning the former into the latter
//! through a [`Codec`]. Pause and flush are signals the worker observes between
//! iterations; flush additionally disables both queues so a worker blocked inside an
//! iteration returns promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::diagnostics::Diagnostics;
use crate::error::{CodecError, EngineError, Result};
use crate::frame::{CompressedPacket, DecodedFrame, MediaType};
use crate::gate::Gate;
use crate::media::{Codec, CodecProvider, Receive, StreamInfo, Submit};
use crate::queue::BoundedQueue;
use crate::time_filter::TimeFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Decoding,
    Paused,
    Draining,
    Stopped,
}

pub struct DecoderUnit {
    name: String,
    stream: StreamInfo,
    packets: Arc<BoundedQueue<CompressedPacket>>,
    frames: Arc<BoundedQueue<DecodedFrame>>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    time_filter: Mutex<TimeFilter>,
    running: AtomicBool,
    /// Set by `stop_decode`; queues stay disabled from then on.
    terminated: AtomicBool,
    /// Cleared while the stream is not presented; the frame queue stays shut.
    selected: AtomicBool,
    /// Open while the worker may start new iterations.
    pause_gate: Gate,
    /// Open while the worker is not inside an iteration.
    idle_gate: Gate,
    state: Mutex<DecoderState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Arc<dyn Diagnostics>,
}

/// B-frame bookkeeping carried across packets by the video drain.
#[derive(Default)]
struct ReorderState {
    frame_delay: bool,
    releasing: bool,
}

impl DecoderUnit {
    pub fn new(
        stream: StreamInfo,
        packet_capacity: usize,
        frame_capacity: usize,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let name = format!("{}-{}", stream.media_type.label(), stream.index);
        Self {
            packets: Arc::new(BoundedQueue::new(format!("{name} packets"), packet_capacity)),
            frames: Arc::new(BoundedQueue::new(format!("{name} frames"), frame_capacity)),
            name,
            stream,
            codec: Mutex::new(None),
            time_filter: Mutex::new(TimeFilter::default()),
            running: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            selected: AtomicBool::new(true),
            pause_gate: Gate::new(true),
            idle_gate: Gate::new(true),
            state: Mutex::new(DecoderState::Idle),
            worker: Mutex::new(None),
            diagnostics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn media_type(&self) -> MediaType {
        self.stream.media_type
    }

    pub fn state(&self) -> DecoderState {
        *lock(&self.state)
    }

    pub fn packets(&self) -> &Arc<BoundedQueue<CompressedPacket>> {
        &self.packets
    }

    pub fn frames(&self) -> &Arc<BoundedQueue<DecodedFrame>> {
        &self.frames
    }

    /// Open a codec for this unit's stream.
    pub fn prepare_decode(&self, provider: &dyn CodecProvider) -> Result<()> {
        let codec = provider
            .open(&self.stream)
            .map_err(|e| EngineError::from_codec(self.stream.index, self.stream.media_type, e))?;
        *lock(&self.codec) = Some(codec);
        tracing::debug!(unit = %self.name, "decoder prepared");
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        lock(&self.codec).is_some()
    }

    /// Spawn the decode worker.
    pub fn start_decode(self: &Arc<Self>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            tracing::debug!(unit = %self.name, "decode already started");
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let unit = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("decode-{}", self.name))
            .spawn(move || unit.decode_loop())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Ask the worker to exit after its current wait.
    pub fn stop_decode(&self) {
        self.running.store(false, Ordering::Release);
        self.terminated.store(true, Ordering::Release);
        self.pause_gate.open();
        self.packets.disable_io(true);
        self.frames.disable_io(true);
    }

    /// Blocking insert into the packet queue. Returns `false` once input is disabled.
    pub fn insert_packet(&self, packet: CompressedPacket) -> bool {
        self.packets.blocking_insert(packet)
    }

    /// Stop accepting packets, waking a producer blocked on a full queue.
    pub fn interrupt_input(&self) {
        self.packets.disable_io(true);
    }

    /// Keep the worker from starting another iteration. Cleared by [`Self::flush`].
    pub fn pause_decode(&self) {
        self.set_state(DecoderState::Draining);
        self.pause_gate.close();
    }

    pub fn enable_time_filter(&self, min_time: f64) {
        lock(&self.time_filter).enable(min_time);
    }

    pub fn disable_time_filter(&self) {
        lock(&self.time_filter).disable();
    }

    /// Discard every queued packet and frame plus whatever the codec holds.
    ///
    /// Returns once both queues are empty and the worker is decoding again.
    pub fn flush(&self) {
        let scope = format!("{} flush", self.name);

        self.pause_decode();
        self.diagnostics.mark(&scope, 1);

        self.packets.disable_io(true);
        self.frames.disable_io(true);
        self.diagnostics.mark(&scope, 2);

        self.idle_gate.wait();
        self.diagnostics.mark(&scope, 3);

        let packets = self.packets.flush();
        let frames = self.frames.flush();
        if let Some(codec) = lock(&self.codec).as_mut() {
            codec.flush_internal_buffers();
        }
        self.diagnostics.mark(&scope, 4);
        tracing::debug!(unit = %self.name, packets, frames, "decoder flushed");

        if self.terminated.load(Ordering::Acquire) {
            // Stopped while flushing: leave the queues shut.
            return;
        }
        self.packets.disable_io(false);
        if self.is_selected() {
            self.frames.disable_io(false);
        }
        if self.terminated.load(Ordering::Acquire) {
            self.packets.disable_io(true);
            self.frames.disable_io(true);
            return;
        }

        let resumed = if self.running.load(Ordering::Acquire) {
            DecoderState::Decoding
        } else {
            DecoderState::Idle
        };
        self.set_state(resumed);
        self.pause_gate.open();
        self.diagnostics.mark(&scope, 5);
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Acquire)
    }

    /// Select or deselect the stream for presentation.
    ///
    /// A deselected unit drops what it had decoded and keeps its frame queue shut,
    /// so consumers see an empty queue instead of blocking on it.
    pub fn set_selected(&self, selected: bool) {
        if self.selected.swap(selected, Ordering::AcqRel) == selected {
            return;
        }
        if selected {
            if !self.terminated.load(Ordering::Acquire) {
                self.frames.disable_io(false);
            }
        } else {
            self.frames.disable_io(true);
            let dropped = self.frames.flush();
            tracing::debug!(unit = %self.name, dropped, "stream deselected");
        }
    }

    /// Terminal teardown: stop the worker, drop every queued item and the codec.
    pub fn free_resources(&self) {
        let scope = format!("{} free", self.name);
        self.stop_decode();
        self.diagnostics.mark(&scope, 1);

        self.idle_gate.wait();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(unit = %self.name, "decode thread panicked");
            }
        }
        self.diagnostics.mark(&scope, 2);

        self.packets.flush();
        self.frames.flush();
        *lock(&self.codec) = None;
        self.set_state(DecoderState::Stopped);
        self.diagnostics.mark(&scope, 3);
    }

    fn set_state(&self, state: DecoderState) {
        let mut current = lock(&self.state);
        if *current != DecoderState::Stopped {
            *current = state;
        }
    }

    fn decode_loop(&self) {
        tracing::debug!(unit = %self.name, "decode thread started");
        self.set_state(DecoderState::Decoding);
        let mut reorder = ReorderState::default();

        loop {
            self.idle_gate.close();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if !self.pause_gate.is_open() {
                if self.state() != DecoderState::Draining {
                    self.set_state(DecoderState::Paused);
                }
                self.diagnostics.mark(&self.name, 1);
                self.idle_gate.open();
                self.pause_gate.wait();
                continue;
            }

            let Some(packet) = self.packets.blocking_remove() else {
                continue;
            };
            self.decode_packet(&packet, &mut reorder);
        }

        self.set_state(DecoderState::Stopped);
        self.idle_gate.open();
        tracing::debug!(unit = %self.name, "decode thread exiting");
    }

    fn decode_packet(&self, packet: &CompressedPacket, reorder: &mut ReorderState) {
        match self.submit(packet) {
            Ok(Submit::Accepted) => {}
            Ok(Submit::Busy) => {
                // Drain pending output, then give the packet one more chance.
                self.drain_all();
                match self.submit(packet) {
                    Ok(Submit::Accepted) => {}
                    Ok(Submit::Busy) => {
                        tracing::debug!(unit = %self.name, pts = packet.pts, "codec still busy; packet dropped");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(unit = %self.name, pts = packet.pts, error = %e, "submit failed");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(unit = %self.name, pts = packet.pts, error = %e, "submit failed");
                return;
            }
        }

        match self.stream.media_type {
            MediaType::Video => self.drain_video(reorder),
            MediaType::Audio | MediaType::Subtitle => self.drain_all(),
        }
    }

    /// Receive until the codec wants more input.
    fn drain_all(&self) {
        loop {
            match self.receive() {
                Ok(Receive::Frame(frame)) => {
                    if !self.deliver(frame) {
                        return;
                    }
                }
                Ok(Receive::NeedMoreInput | Receive::EndOfStream) => return,
                Err(e) => {
                    tracing::warn!(unit = %self.name, error = %e, "receive failed");
                    return;
                }
            }
        }
    }

    /// One frame per packet normally; after a reorder stall keep draining until the
    /// held-back frames have all surfaced.
    fn drain_video(&self, reorder: &mut ReorderState) {
        loop {
            match self.receive() {
                Ok(Receive::Frame(frame)) => {
                    if reorder.frame_delay {
                        reorder.releasing = true;
                        reorder.frame_delay = false;
                    }
                    if !self.deliver(frame) {
                        reorder.releasing = false;
                        return;
                    }
                }
                Ok(Receive::NeedMoreInput) => {
                    reorder.frame_delay = true;
                    reorder.releasing = false;
                    return;
                }
                Ok(Receive::EndOfStream) => {
                    reorder.releasing = false;
                    return;
                }
                Err(e) => {
                    tracing::warn!(unit = %self.name, error = %e, "receive failed");
                    reorder.releasing = false;
                    return;
                }
            }
            if !reorder.releasing {
                return;
            }
        }
    }

    /// Filter and queue one decoded frame. Returns `false` once output is disabled.
    fn deliver(&self, frame: DecodedFrame) -> bool {
        let keep = lock(&self.time_filter).check(frame.pts(), frame.time_base());
        if !keep {
            return true;
        }
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if frame.media_type() == MediaType::Subtitle {
            // Nothing lays subtitles out; the frame is released here.
            self.diagnostics.time_mark("subtitle frame");
            return true;
        }
        if self.frames.is_empty() {
            let label = format!("{} first", self.stream.media_type.label());
            self.diagnostics
                .label_mark(&label, &format!("{:.3}", frame.presentation_secs()));
        }
        self.frames.blocking_insert(frame)
    }

    fn submit(&self, packet: &CompressedPacket) -> std::result::Result<Submit, CodecError> {
        match lock(&self.codec).as_mut() {
            Some(codec) => codec.submit(packet),
            None => Err(CodecError::Unavailable("decoder not prepared".into())),
        }
    }

    fn receive(&self) -> std::result::Result<Receive, CodecError> {
        match lock(&self.codec).as_mut() {
            Some(codec) => codec.receive(),
            None => Ok(Receive::EndOfStream),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::recording::RecordingDiagnostics;
    use crate::diagnostics::NullDiagnostics;
    use crate::test_support::{CodecScript, ScriptedCodecs, audio_stream, packet, video_stream};
    use std::time::{Duration, Instant};

    fn unit(stream: StreamInfo, frame_capacity: usize) -> Arc<DecoderUnit> {
        Arc::new(DecoderUnit::new(stream, 16, frame_capacity, Arc::new(NullDiagnostics)))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn drain_pts(frames: &BoundedQueue<DecodedFrame>) -> Vec<i64> {
        let mut out = Vec::new();
        while !frames.is_empty() {
            if let Some(f) = frames.blocking_remove() {
                out.push(f.pts());
            }
        }
        out
    }

    #[test]
    fn prepare_reports_codec_failures() {
        let codecs = ScriptedCodecs::default().failing(MediaType::Audio, CodecError::Unavailable("pcm".into()));
        let u = unit(audio_stream(1), 8);
        let err = u.prepare_decode(&codecs).unwrap_err();
        assert!(matches!(err, EngineError::CodecUnavailable { stream: 1, .. }));
        assert!(!u.is_prepared());
    }

    #[test]
    fn audio_frames_flow_through_in_order() {
        let codecs = ScriptedCodecs::default();
        let u = unit(audio_stream(0), 32);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();

        for pts in [0, 10, 20, 30] {
            assert!(u.insert_packet(packet(0, pts, 10)));
        }
        assert!(wait_for(|| u.frames().len() == 4));
        assert_eq!(drain_pts(u.frames()), vec![0, 10, 20, 30]);

        u.free_resources();
        assert_eq!(u.state(), DecoderState::Stopped);
    }

    #[test]
    fn time_filter_drops_frames_before_cutoff() {
        let codecs = ScriptedCodecs::default();
        let u = unit(audio_stream(0), 32);
        u.prepare_decode(&codecs).unwrap();
        u.enable_time_filter(0.025);
        u.start_decode().unwrap();

        for pts in [0, 10, 20, 30, 40] {
            u.insert_packet(packet(0, pts, 10));
        }
        assert!(wait_for(|| u.packets().is_empty() && u.frames().len() == 2));
        assert_eq!(drain_pts(u.frames()), vec![30, 40]);
        u.free_resources();
    }

    #[test]
    fn video_drain_surfaces_every_reordered_frame() {
        // Decoder holds frames back: P1 -> F1, P2 -> nothing, P3 -> F3 F2,
        // P4 -> nothing, P5 -> F5 F4.
        let script = CodecScript::Batches(vec![vec![0], vec![], vec![80, 40], vec![], vec![160, 120]]);
        let codecs = ScriptedCodecs::default().video(script);
        let u = unit(video_stream(0), 32);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();

        for (i, pts) in [0, 80, 40, 160, 120].into_iter().enumerate() {
            u.insert_packet(packet(0, pts, 40));
            let expected = [1, 1, 3, 3, 5][i];
            assert!(wait_for(|| u.frames().len() == expected), "after packet {i}");
        }
        assert_eq!(drain_pts(u.frames()), vec![0, 80, 40, 160, 120]);
        u.free_resources();
    }

    #[test]
    fn busy_codec_is_drained_before_retry() {
        let codecs = ScriptedCodecs::default().busy_submits(1);
        let u = unit(audio_stream(0), 32);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();

        u.insert_packet(packet(0, 0, 10));
        u.insert_packet(packet(0, 10, 10));
        assert!(wait_for(|| u.frames().len() == 2));
        assert_eq!(codecs.stats().submitted(), 2);
        u.free_resources();
    }

    #[test]
    fn flush_unblocks_worker_stuck_on_full_frame_queue() {
        let script = CodecScript::Batches(vec![(0..10).map(|i| i * 10).collect()]);
        let codecs = ScriptedCodecs::default().audio(script);
        let diag = Arc::new(RecordingDiagnostics::default());
        let u = Arc::new(DecoderUnit::new(audio_stream(0), 16, 2, diag.clone()));
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();

        u.insert_packet(packet(0, 0, 10));
        for pts in 1..5 {
            u.insert_packet(packet(0, pts * 100, 10));
        }
        assert!(wait_for(|| u.frames().len() == 2));

        let started = Instant::now();
        u.flush();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(u.packets().is_empty());
        assert!(u.frames().is_empty());
        assert_eq!(codecs.stats().flushes(), 1);

        let marks = diag.marks.lock().unwrap();
        let flush_steps: Vec<u32> = marks
            .iter()
            .filter(|(scope, _)| scope == "audio-0 flush")
            .map(|(_, step)| *step)
            .collect();
        assert_eq!(flush_steps, vec![1, 2, 3, 4, 5]);
        drop(marks);

        // Decoding resumes after the flush.
        u.insert_packet(packet(0, 500, 10));
        assert!(wait_for(|| u.frames().len() == 1));
        u.free_resources();
    }

    #[test]
    fn flush_before_start_is_immediate() {
        let codecs = ScriptedCodecs::default();
        let u = unit(audio_stream(0), 8);
        u.prepare_decode(&codecs).unwrap();
        u.insert_packet(packet(0, 0, 10));
        u.flush();
        assert!(u.packets().is_empty());
        assert_eq!(u.state(), DecoderState::Idle);
    }

    #[test]
    fn subtitle_frames_are_released_not_queued() {
        let codecs = ScriptedCodecs::default();
        let u = unit(crate::test_support::subtitle_stream(2), 8);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();
        u.insert_packet(packet(2, 0, 1000));
        assert!(wait_for(|| u.packets().is_empty()));
        thread::sleep(Duration::from_millis(20));
        assert!(u.frames().is_empty());
        u.free_resources();
    }

    #[test]
    fn stop_wakes_idle_worker() {
        let codecs = ScriptedCodecs::default();
        let u = unit(audio_stream(0), 8);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();
        assert!(wait_for(|| u.state() == DecoderState::Decoding));
        u.free_resources();
        assert!(!u.is_prepared());
        assert_eq!(u.state(), DecoderState::Stopped);
    }

    #[test]
    fn deselected_unit_releases_waiting_consumer() {
        let codecs = ScriptedCodecs::default();
        let u = unit(audio_stream(0), 8);
        u.prepare_decode(&codecs).unwrap();
        u.start_decode().unwrap();
        u.insert_packet(packet(0, 0, 10));
        assert!(wait_for(|| u.frames().len() == 1));

        let frames = Arc::clone(u.frames());
        let consumer = thread::spawn(move || {
            // First remove gets the queued frame, the second would block.
            let first = frames.blocking_remove();
            let second = frames.blocking_remove();
            (first.is_some(), second.is_none())
        });
        thread::sleep(Duration::from_millis(20));
        u.set_selected(false);
        assert_eq!(consumer.join().unwrap(), (true, true));

        // Flushing keeps a deselected queue shut; reselecting opens it.
        u.flush();
        assert!(!u.frames().io_enabled());
        u.set_selected(true);
        assert!(u.frames().io_enabled());
        u.insert_packet(packet(0, 10, 10));
        assert!(wait_for(|| u.frames().len() == 1));
        u.free_resources();
    }
}
