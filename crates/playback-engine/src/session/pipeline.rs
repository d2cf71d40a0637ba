//! One opened source: the read thread, decoder units, display and the seek protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use playback_types::{PlaybackEndReason, SessionEvent, SessionState};

use crate::clock::SyncClock;
use crate::config::{EngineConfig, MediaTypes};
use crate::decoder::DecoderUnit;
use crate::diagnostics::Diagnostics;
use crate::display::DisplayController;
use crate::error::Result;
use crate::frame::{CompressedPacket, MediaType};
use crate::gate::Gate;
use crate::media::{Demuxer, ReadOutcome, SessionObserver, SourceInfo};
use crate::queue::{SizeCrossing, Trigger};

/// Consecutive demuxer errors after which the source counts as ended.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 32;

/// Session-wide state shared with pipeline threads.
pub(crate) struct SessionShared {
    state: Mutex<SessionState>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "session state");
            *current = state;
        }
    }

    /// Replace `from` with `to`; returns whether the swap happened.
    pub(crate) fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut current = lock(&self.state);
        if from.contains(&*current) {
            tracing::debug!(from = ?*current, to = ?to, "session state");
            *current = to;
            true
        } else {
            false
        }
    }
}

pub(crate) struct PipelineParts {
    pub(crate) info: SourceInfo,
    pub(crate) demuxer: Box<dyn Demuxer>,
    pub(crate) video: Option<Arc<DecoderUnit>>,
    pub(crate) audio: Option<Arc<DecoderUnit>>,
    pub(crate) subtitle: Option<Arc<DecoderUnit>>,
    pub(crate) display: Arc<DisplayController>,
    pub(crate) clock: Arc<SyncClock>,
    pub(crate) real: MediaTypes,
}

pub(crate) struct Pipeline {
    info: SourceInfo,
    pub(crate) video: Option<Arc<DecoderUnit>>,
    pub(crate) audio: Option<Arc<DecoderUnit>>,
    pub(crate) subtitle: Option<Arc<DecoderUnit>>,
    pub(crate) display: Arc<DisplayController>,
    clock: Arc<SyncClock>,
    demuxer: Mutex<Option<Box<dyn Demuxer>>>,
    real: Mutex<MediaTypes>,
    /// Unit whose frame queue decides buffering and end of playback.
    check: Mutex<Option<Arc<DecoderUnit>>>,

    /// Open while the reader may pull packets.
    read_gate: Gate,
    /// Open while the reader is parked (or gone).
    reader_idle: Gate,

    stopping: AtomicBool,
    end_pending: AtomicBool,
    end_reason: Mutex<PlaybackEndReason>,
    finished: AtomicBool,
    seeking: AtomicBool,
    prepare_for_seeking: AtomicBool,
    user_paused: AtomicBool,
    buffering: AtomicBool,
    mark_time: Mutex<f64>,
    seek_lock: Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    prefer_audio_master: bool,
    buffer_empty_size: usize,
    play_resume_size: usize,
    shared: Arc<SessionShared>,
    events: Arc<dyn SessionObserver>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl Pipeline {
    pub(crate) fn new(
        parts: PipelineParts,
        config: &EngineConfig,
        shared: Arc<SessionShared>,
        events: Arc<dyn SessionObserver>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        for unit in [&parts.video, &parts.audio, &parts.subtitle].into_iter().flatten() {
            unit.set_selected(parts.real.contains(unit.media_type()));
        }
        parts.display.set_video_selected(parts.real.video);
        Self {
            info: parts.info,
            video: parts.video,
            audio: parts.audio,
            subtitle: parts.subtitle,
            display: parts.display,
            clock: parts.clock,
            demuxer: Mutex::new(Some(parts.demuxer)),
            real: Mutex::new(parts.real),
            check: Mutex::new(None),
            read_gate: Gate::new(false),
            reader_idle: Gate::new(true),
            stopping: AtomicBool::new(false),
            end_pending: AtomicBool::new(false),
            end_reason: Mutex::new(PlaybackEndReason::Eof),
            finished: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            prepare_for_seeking: AtomicBool::new(false),
            user_paused: AtomicBool::new(false),
            buffering: AtomicBool::new(false),
            mark_time: Mutex::new(0.0),
            seek_lock: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
            prefer_audio_master: config.prefer_audio_master,
            buffer_empty_size: config.buffer_empty_size,
            play_resume_size: config.play_resume_size,
            shared,
            events,
            diagnostics,
        }
    }

    fn units(&self) -> impl Iterator<Item = &Arc<DecoderUnit>> {
        [&self.video, &self.audio, &self.subtitle]
            .into_iter()
            .flatten()
    }

    pub(crate) fn duration(&self) -> f64 {
        self.info.duration_secs
    }

    pub(crate) fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub(crate) fn real_media_types(&self) -> MediaTypes {
        *lock(&self.real)
    }

    pub(crate) fn master_is_audio(&self) -> bool {
        self.clock.master_is_audio()
    }

    pub(crate) fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    pub(crate) fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    pub(crate) fn is_user_paused(&self) -> bool {
        self.user_paused.load(Ordering::Acquire)
    }

    pub(crate) fn end_reason(&self) -> Option<PlaybackEndReason> {
        if self.finished.load(Ordering::Acquire) {
            Some(*lock(&self.end_reason))
        } else {
            None
        }
    }

    /// Recompute the presented set and the master clock from `desired`.
    pub(crate) fn apply_media_types(self: &Arc<Self>, desired: MediaTypes) {
        let present = MediaTypes {
            video: self.video.is_some(),
            audio: self.audio.is_some(),
            subtitle: self.subtitle.is_some(),
        };
        let real = desired.intersect(present);
        *lock(&self.real) = real;
        self.clock
            .select_master(real.audio, real.video, self.prefer_audio_master);
        for unit in self.units() {
            unit.set_selected(real.contains(unit.media_type()));
        }
        self.display.set_video_selected(real.video);
        tracing::debug!(?real, master_audio = self.clock.master_is_audio(), "display media types");

        let playing = lock(&self.check).is_some();
        if playing && !self.stopping.load(Ordering::Acquire) {
            self.register_buffer_observers();
        }
    }

    /// Start reading, decoding and presenting.
    pub(crate) fn play(self: &Arc<Self>) -> Result<()> {
        self.register_buffer_observers();
        self.read_gate.open();

        let pipeline = Arc::clone(self);
        let reader = thread::Builder::new()
            .name("read".into())
            .spawn(move || pipeline.read_loop())?;
        lock(&self.threads).push(reader);

        for unit in self.units() {
            unit.start_decode()?;
        }
        self.display.start_display()?;
        Ok(())
    }

    /// Low/drained/resume observers on the check stream's frame queue.
    fn register_buffer_observers(self: &Arc<Self>) {
        let real = self.real_media_types();
        let check = if real.audio {
            self.audio.clone()
        } else if real.video {
            self.video.clone()
        } else {
            self.audio.clone().or_else(|| self.video.clone())
        };
        let Some(check) = check else {
            return;
        };
        let previous = lock(&self.check).replace(Arc::clone(&check));
        if let Some(previous) = previous {
            if Arc::ptr_eq(&previous, &check) {
                return;
            }
            previous.frames().clear_observers();
        }
        tracing::debug!(unit = check.name(), "buffer check stream");
        let frames = check.frames();

        let weak = Arc::downgrade(self);
        frames.add_observer(
            self.buffer_empty_size,
            Trigger::AtMost,
            Arc::new(move |crossing: SizeCrossing| with(&weak, |p| p.on_buffer_low(crossing))),
        );
        let weak = Arc::downgrade(self);
        frames.add_observer(
            0,
            Trigger::AtMost,
            Arc::new(move |_crossing: SizeCrossing| with(&weak, |p| p.on_buffer_drained())),
        );
        let weak = Arc::downgrade(self);
        frames.add_observer(
            self.play_resume_size,
            Trigger::AtLeast,
            Arc::new(move |_crossing: SizeCrossing| with(&weak, |p| p.buffer_done())),
        );
    }

    fn on_buffer_low(&self, crossing: SizeCrossing) -> bool {
        if self.end_pending.load(Ordering::Acquire) {
            // Draining the tail of the source, not a stall.
            return false;
        }
        if self.prepare_for_seeking.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
            return false;
        }
        tracing::info!(size = crossing.size, "buffer ran out; buffering");
        self.buffering.store(true, Ordering::Release);
        self.events
            .on_event(SessionEvent::BufferingChanged { buffering: true });
        self.display.pause(true);
        true
    }

    fn on_buffer_drained(&self) -> bool {
        if !self.end_pending.load(Ordering::Acquire) {
            return false;
        }
        self.finish();
        true
    }

    /// Enough data is buffered: resume a stalled display and complete a pending seek.
    fn buffer_done(&self) -> bool {
        if self.prepare_for_seeking.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
            return false;
        }
        let user_paused = self.is_user_paused();
        if !user_paused && self.display.is_paused() {
            self.display.pause(false);
        }
        if self.buffering.swap(false, Ordering::AcqRel) {
            tracing::info!("buffer refilled");
            self.events
                .on_event(SessionEvent::BufferingChanged { buffering: false });
        }
        if self.seeking.swap(false, Ordering::AcqRel) {
            let target = *lock(&self.mark_time);
            tracing::info!(target_secs = target, "seek completed");
            self.restore_play_state();
            self.events.on_event(SessionEvent::SeekCompleted {
                target_secs: target,
                ok: true,
            });
        }
        true
    }

    fn restore_play_state(&self) {
        let state = if self.is_user_paused() {
            SessionState::Paused
        } else {
            SessionState::Playing
        };
        self.shared.transition(&[SessionState::Seeking], state);
    }

    /// Report the end of playback once.
    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = *lock(&self.end_reason);
        tracing::info!(?reason, "playback finished");
        self.events.on_event(SessionEvent::Finished { reason });
    }

    /// Pause or resume presentation. Reading and decoding keep going.
    pub(crate) fn pause(&self, paused: bool) {
        if paused {
            let now = self.current_time();
            *lock(&self.mark_time) = now;
        }
        self.user_paused.store(paused, Ordering::Release);
        if self.is_seeking() {
            // Applied by the seek completion.
            return;
        }
        if !paused && self.is_buffering() {
            // The refill observer resumes the display.
            return;
        }
        self.display.pause(paused);
    }

    /// Last presented media time, or the mark time while seeking, paused or before
    /// anything was presented.
    pub(crate) fn current_time(&self) -> f64 {
        let mark = *lock(&self.mark_time);
        let time = match self.display.play_time() {
            Some(t) if !self.is_seeking() && !self.is_user_paused() => t,
            _ => mark,
        };
        let time = time.max(0.0);
        if self.duration() > 0.0 {
            time.min(self.duration())
        } else {
            time
        }
    }

    fn read_loop(&self) {
        tracing::debug!("read thread started");
        let mut errors = 0u32;

        loop {
            self.reader_idle.close();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if !self.read_gate.is_open() {
                self.reader_idle.open();
                self.read_gate.wait();
                continue;
            }

            let outcome = {
                let mut demuxer = lock(&self.demuxer);
                match demuxer.as_mut() {
                    Some(d) => d.read_packet(),
                    None => break,
                }
            };

            match outcome {
                Ok(ReadOutcome::Packet(packet)) => {
                    errors = 0;
                    self.route(packet);
                }
                Ok(ReadOutcome::EndOfStream) => {
                    tracing::info!("end of source");
                    self.mark_end(PlaybackEndReason::Eof);
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!(error = %format!("{e:#}"), errors, "read failed");
                    if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        self.mark_end(PlaybackEndReason::Error);
                    }
                }
            }
        }

        self.reader_idle.open();
        tracing::debug!("read thread exiting");
    }

    fn route(&self, packet: CompressedPacket) {
        let real = self.real_media_types();
        let target = self
            .units()
            .find(|u| u.stream().index == packet.stream_index)
            .filter(|u| real.contains(u.media_type()));
        let Some(unit) = target else {
            return;
        };
        let label = match unit.media_type() {
            MediaType::Video => "video packet in",
            MediaType::Audio => "audio packet in",
            MediaType::Subtitle => "subtitle packet in",
        };
        if unit.insert_packet(packet) {
            self.diagnostics.time_mark(label);
        }
    }

    /// No more packets will come: park the reader until a seek or stop.
    fn mark_end(&self, reason: PlaybackEndReason) {
        *lock(&self.end_reason) = reason;
        self.end_pending.store(true, Ordering::Release);
        self.read_gate.close();

        // A stall or seek waiting for the resume threshold would never see it now.
        if self.display.is_paused() && (self.is_buffering() || self.is_seeking()) {
            self.buffer_done();
        }

        let drained = lock(&self.check)
            .as_ref()
            .is_some_and(|c| c.frames().is_empty() && c.packets().is_empty());
        if drained {
            self.finish();
        }
    }

    /// Queue a seek on its own thread; seeks run one at a time.
    pub(crate) fn seek_to(self: &Arc<Self>, target: f64) -> Result<()> {
        let pipeline = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("seek".into())
            .spawn(move || pipeline.seek_operation(target))?;
        let mut threads = lock(&self.threads);
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }

    fn seek_operation(&self, target: f64) {
        let _serial = lock(&self.seek_lock);
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let duration = self.duration();
        let mut time = target.max(0.0);
        if duration > 0.0 && time >= duration {
            time = (duration - 0.1).max(0.0);
        }
        tracing::info!(target_secs = time, "seek");
        self.diagnostics.mark("seek", 1);

        self.prepare_for_seeking.store(true, Ordering::Release);
        self.seeking.store(true, Ordering::Release);
        *lock(&self.mark_time) = time;
        self.shared.transition(
            &[SessionState::Playing, SessionState::Paused, SessionState::Seeking],
            SessionState::Seeking,
        );

        // Turn off the inlet and wait for the reader to park.
        self.read_gate.close();
        for unit in self.units() {
            unit.pause_decode();
            unit.interrupt_input();
        }
        self.reader_idle.wait();
        self.diagnostics.mark("seek", 2);
        if self.stopping.load(Ordering::Acquire) {
            self.prepare_for_seeking.store(false, Ordering::Release);
            return;
        }
        self.end_pending.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        self.display.pause(true);
        for unit in self.units() {
            unit.flush();
        }
        self.display.flush();
        for unit in self.units() {
            unit.enable_time_filter(time);
        }
        self.display.reset_play_time();
        self.diagnostics.mark("seek", 3);

        let reference = self.video.as_ref().or(self.audio.as_ref());
        let result = match reference {
            Some(unit) => {
                let stream = unit.stream();
                let ts = stream.time_base.timestamp(time);
                match lock(&self.demuxer).as_mut() {
                    Some(d) => d.seek(stream.index, ts),
                    None => Err(anyhow::anyhow!("source closed")),
                }
            }
            None => Err(anyhow::anyhow!("no stream to seek on")),
        };
        self.diagnostics.mark("seek", 4);

        if let Err(e) = result {
            tracing::warn!(target_secs = time, error = %format!("{e:#}"), "seek failed");
            for unit in self.units() {
                unit.disable_time_filter();
            }
            self.seeking.store(false, Ordering::Release);
            self.display.pause(self.is_user_paused());
            self.restore_play_state();
            self.events.on_event(SessionEvent::SeekCompleted {
                target_secs: time,
                ok: false,
            });
        }

        // Cleared before the reader resumes so the refill can complete the seek.
        self.prepare_for_seeking.store(false, Ordering::Release);
        self.read_gate.open();
        self.diagnostics.mark("seek", 5);
    }

    /// Signal every thread to wind down. Does not block.
    pub(crate) fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.display.stop_display();
        for unit in self.units() {
            unit.stop_decode();
        }
        self.read_gate.open();
    }

    /// Whether an end of playback was already reported; marks it reported if not.
    pub(crate) fn take_finish(&self, reason: PlaybackEndReason) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.end_reason) = reason;
        true
    }

    /// Join every pipeline thread and release units, display and the source.
    pub(crate) fn teardown(&self) {
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("pipeline thread panicked");
            }
        }
        for unit in self.units() {
            unit.frames().clear_observers();
            unit.free_resources();
        }
        *lock(&self.check) = None;
        self.display.free_resources();
        // The source goes last.
        *lock(&self.demuxer) = None;
        tracing::debug!("pipeline released");
    }

    #[cfg(test)]
    pub(crate) fn tracked_threads(&self) -> usize {
        lock(&self.threads).len()
    }

    pub(crate) fn frames_buffered(&self, media: MediaType) -> Option<usize> {
        let unit = match media {
            MediaType::Video => self.video.as_ref(),
            MediaType::Audio => self.audio.as_ref(),
            MediaType::Subtitle => self.subtitle.as_ref(),
        };
        unit.map(|u| u.frames().len())
    }
}

fn with(weak: &Weak<Pipeline>, f: impl FnOnce(&Pipeline) -> bool) -> bool {
    weak.upgrade().is_some_and(|p| f(&p))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
