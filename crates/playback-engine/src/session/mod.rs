//! Top-level playback orchestration.
//!
//! A [`PlaybackSession`] opens a source through its [`SourceOpener`], builds one
//! [`DecoderUnit`] per present stream plus the [`DisplayController`], and drives them
//! through play, pause, seek and stop. The session is reusable: after a stop has
//! finished tearing down, the next `open` starts from `Idle` again.

mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use playback_types::{PlaybackEndReason, SessionEvent, SessionState, SessionStatus};

use crate::clock::SyncClock;
use crate::config::{EngineConfig, MediaTypes};
use crate::decoder::DecoderUnit;
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::display::{AudioOutput, AudioPull, DisplayController, VideoOutput};
use crate::error::{EngineError, Result};
use crate::frame::{AudioFormat, MediaType};
use crate::media::{
    AudioResampler, CodecProvider, FormatNegotiator, NullObserver, ResamplerFactory,
    SessionObserver, SourceInfo, SourceOpener, StreamInfo, VideoRenderer,
};
use crate::resample::RubatoResampler;

use pipeline::{Pipeline, PipelineParts, SessionShared};

fn rubato_resampler(source: AudioFormat, output: AudioFormat) -> anyhow::Result<Box<dyn AudioResampler>> {
    Ok(Box::new(RubatoResampler::new(source, output)?))
}

/// Builder for [`PlaybackSession`].
pub struct SessionBuilder {
    opener: Arc<dyn SourceOpener>,
    codecs: Arc<dyn CodecProvider>,
    renderer: Option<Arc<dyn VideoRenderer>>,
    negotiator: Option<Arc<FormatNegotiator>>,
    resamplers: Option<Arc<ResamplerFactory>>,
    config: EngineConfig,
    observer: Arc<dyn SessionObserver>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl SessionBuilder {
    pub fn renderer(mut self, renderer: Arc<dyn VideoRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Map the source audio format to the format the output device adopts.
    pub fn negotiator(
        mut self,
        negotiator: impl Fn(AudioFormat) -> AudioFormat + Send + Sync + 'static,
    ) -> Self {
        self.negotiator = Some(Arc::new(negotiator));
        self
    }

    pub fn resampler_factory(mut self, factory: Arc<ResamplerFactory>) -> Self {
        self.resamplers = Some(factory);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn build(self) -> PlaybackSession {
        let resamplers = self
            .resamplers
            .unwrap_or_else(|| Arc::new(rubato_resampler) as Arc<ResamplerFactory>);
        let desired = self.config.display_media_types;
        PlaybackSession {
            opener: self.opener,
            codecs: self.codecs,
            renderer: self.renderer,
            negotiator: self.negotiator,
            resamplers,
            config: self.config,
            events: self.observer,
            diagnostics: self.diagnostics,
            shared: Arc::new(SessionShared::new()),
            active: Mutex::new(None),
            teardown: Mutex::new(None),
            desired: Mutex::new(desired),
            open_abort: AtomicBool::new(false),
            audio_pull: AudioPull::default(),
        }
    }
}

pub struct PlaybackSession {
    opener: Arc<dyn SourceOpener>,
    codecs: Arc<dyn CodecProvider>,
    renderer: Option<Arc<dyn VideoRenderer>>,
    negotiator: Option<Arc<FormatNegotiator>>,
    resamplers: Arc<ResamplerFactory>,
    config: EngineConfig,
    events: Arc<dyn SessionObserver>,
    diagnostics: Arc<dyn Diagnostics>,
    shared: Arc<SessionShared>,
    active: Mutex<Option<Arc<Pipeline>>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
    desired: Mutex<MediaTypes>,
    open_abort: AtomicBool,
    audio_pull: AudioPull,
}

impl PlaybackSession {
    pub fn builder(opener: Arc<dyn SourceOpener>, codecs: Arc<dyn CodecProvider>) -> SessionBuilder {
        SessionBuilder {
            opener,
            codecs,
            renderer: None,
            negotiator: None,
            resamplers: None,
            config: EngineConfig::default(),
            observer: Arc::new(NullObserver),
            diagnostics: Arc::new(TracingDiagnostics::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for the host audio device callback. Valid for the session's lifetime.
    pub fn audio_pull(&self) -> AudioPull {
        self.audio_pull.clone()
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        lock(&self.active).clone()
    }

    fn require_pipeline(&self, op: &'static str, allowed: &[SessionState]) -> Result<Arc<Pipeline>> {
        let state = self.state();
        match self.pipeline() {
            Some(p) if allowed.contains(&state) => Ok(p),
            _ => Err(EngineError::InvalidState { op, state }),
        }
    }

    /// Open `location`, probe its streams and prepare a decoder for each.
    ///
    /// Emits `ConnectCompleted` on success and leaves the session `Prepared`.
    pub fn open(&self, location: &str) -> Result<SourceInfo> {
        self.wait_stopped();
        let state = self.state();
        if !self
            .shared
            .transition(&[SessionState::Idle, SessionState::Stopped], SessionState::Idle)
        {
            return Err(EngineError::InvalidState { op: "open", state });
        }

        match self.open_inner(location) {
            Ok(info) => Ok(info),
            Err(e) => {
                tracing::warn!(location, error = %e, "open failed");
                self.shared.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    fn open_inner(&self, location: &str) -> Result<SourceInfo> {
        self.open_abort.store(false, Ordering::Release);
        let demuxer = match self.opener.open(location, &self.open_abort) {
            Ok(d) => d,
            Err(e) if self.open_abort.swap(false, Ordering::AcqRel) => {
                tracing::debug!(error = %format!("{e:#}"), "open cancelled");
                return Err(EngineError::Cancelled);
            }
            Err(e) => return Err(EngineError::SourceOpen(e)),
        };
        if self.open_abort.swap(false, Ordering::AcqRel) {
            return Err(EngineError::Cancelled);
        }

        let info = demuxer.info().clone();
        let video_stream = info.first_of(MediaType::Video).cloned();
        let audio_stream = info.first_of(MediaType::Audio).cloned();
        let subtitle_stream = info.first_of(MediaType::Subtitle).cloned();
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(EngineError::NoPlayableStream);
        }

        let present = MediaTypes {
            video: video_stream.is_some(),
            audio: audio_stream.is_some(),
            subtitle: subtitle_stream.is_some(),
        };
        let desired = *lock(&self.desired);
        let real = desired.intersect(present);
        if !real.video && !real.audio {
            return Err(EngineError::NoPlayableStream);
        }
        if real.video && self.renderer.is_none() {
            return Err(EngineError::MissingRenderer);
        }

        let make_unit = |stream: StreamInfo| -> Result<Arc<DecoderUnit>> {
            let frame_capacity = self.config.frame_queue_capacity(stream.media_type);
            let unit = DecoderUnit::new(
                stream,
                self.config.packet_queue_capacity,
                frame_capacity,
                Arc::clone(&self.diagnostics),
            );
            unit.prepare_decode(self.codecs.as_ref())?;
            Ok(Arc::new(unit))
        };
        let video = video_stream.map(&make_unit).transpose()?;
        let audio = audio_stream.clone().map(&make_unit).transpose()?;
        let subtitle = subtitle_stream.map(&make_unit).transpose()?;

        let clock = Arc::new(SyncClock::new(self.config.prefer_audio_master));
        clock.select_master(real.audio, real.video, self.config.prefer_audio_master);

        let audio_output = match (&audio, &audio_stream) {
            (Some(unit), Some(stream)) => Some(self.audio_output(unit, stream)?),
            _ => None,
        };
        let video_output = match (&video, &self.renderer) {
            (Some(unit), Some(renderer)) => Some(VideoOutput {
                frames: Arc::clone(unit.frames()),
                renderer: Arc::clone(renderer),
            }),
            _ => None,
        };
        let display = Arc::new(DisplayController::new(
            Arc::clone(&clock),
            video_output,
            audio_output,
            self.config.min_exec_time,
            self.config.plane_crop.clone(),
            Arc::clone(&self.diagnostics),
        ));

        let pipeline = Arc::new(Pipeline::new(
            PipelineParts {
                info: info.clone(),
                demuxer,
                video,
                audio,
                subtitle,
                display: Arc::clone(&display),
                clock,
                real,
            },
            &self.config,
            Arc::clone(&self.shared),
            Arc::clone(&self.events),
            Arc::clone(&self.diagnostics),
        ));

        *lock(&self.active) = Some(pipeline);
        self.audio_pull.attach(Some(display));
        self.shared.set_state(SessionState::Prepared);
        tracing::info!(
            location,
            streams = info.streams.len(),
            duration_secs = info.duration_secs,
            ?real,
            "source opened"
        );
        self.events.on_event(SessionEvent::ConnectCompleted {
            duration_secs: info.duration_secs,
        });
        Ok(info)
    }

    fn audio_output(&self, unit: &Arc<DecoderUnit>, stream: &StreamInfo) -> Result<AudioOutput> {
        let source = stream.params.audio_format.ok_or_else(|| EngineError::CodecOpenFailed {
            stream: stream.index,
            media: MediaType::Audio.label(),
            reason: "unknown source audio format".into(),
        })?;
        let adopted = self.negotiator.as_ref().map_or(source, |n| n(source));
        let resampler = if adopted != source {
            tracing::info!(?source, ?adopted, "audio conversion");
            let r = (self.resamplers)(source, adopted).map_err(|e| EngineError::CodecOpenFailed {
                stream: stream.index,
                media: MediaType::Audio.label(),
                reason: format!("{e:#}"),
            })?;
            Some(r)
        } else {
            None
        };
        Ok(AudioOutput {
            frames: Arc::clone(unit.frames()),
            format: adopted,
            resampler,
        })
    }

    /// Abort an `open` blocked in the source opener.
    pub fn cancel_open(&self) {
        self.open_abort.store(true, Ordering::Release);
    }

    /// Start reading, decoding and presenting a prepared source.
    pub fn play(&self) -> Result<()> {
        let pipeline = self.require_pipeline("play", &[SessionState::Prepared])?;
        pipeline.play()?;
        self.shared.set_state(SessionState::Playing);
        Ok(())
    }

    /// Pause or resume presentation; reading and decoding keep buffers warm.
    pub fn pause(&self, paused: bool) -> Result<()> {
        let pipeline = self.require_pipeline(
            "pause",
            &[SessionState::Playing, SessionState::Paused, SessionState::Seeking],
        )?;
        pipeline.pause(paused);
        let to = if paused {
            SessionState::Paused
        } else {
            SessionState::Playing
        };
        self.shared
            .transition(&[SessionState::Playing, SessionState::Paused], to);
        Ok(())
    }

    /// Seek to `secs`. Completion is reported through `SeekCompleted`.
    pub fn seek_to(&self, secs: f64) -> Result<()> {
        let pipeline = self.require_pipeline(
            "seek",
            &[SessionState::Playing, SessionState::Paused, SessionState::Seeking],
        )?;
        pipeline.seek_to(secs)
    }

    /// Seek relative to [`Self::current_time`].
    pub fn seek_by(&self, interval: f64) -> Result<()> {
        let now = self.current_time();
        self.seek_to(now + interval)
    }

    /// Stop playback and release everything in the background.
    ///
    /// The session returns to `Idle` once teardown completes; see [`Self::wait_stopped`].
    pub fn stop(&self) {
        let Some(pipeline) = lock(&self.active).take() else {
            return;
        };
        self.shared.set_state(SessionState::Stopping);
        pipeline.begin_stop();
        self.audio_pull.attach(None);
        if pipeline.take_finish(PlaybackEndReason::Stopped) {
            self.events.on_event(SessionEvent::Finished {
                reason: PlaybackEndReason::Stopped,
            });
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("teardown".into())
            .spawn(move || {
                pipeline.teardown();
                shared.set_state(SessionState::Stopped);
                shared.set_state(SessionState::Idle);
            });
        match spawned {
            Ok(handle) => *lock(&self.teardown) = Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "teardown thread spawn failed; releasing inline");
                self.shared.set_state(SessionState::Idle);
            }
        }
    }

    /// Block until a pending teardown has finished.
    pub fn wait_stopped(&self) {
        let handle = lock(&self.teardown).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("teardown thread panicked");
            }
        }
    }

    /// Choose which stream types are decoded and presented.
    ///
    /// Video stays off without a renderer.
    pub fn set_display_media_types(&self, mut types: MediaTypes) {
        types.video &= self.renderer.is_some();
        *lock(&self.desired) = types;
        if let Some(pipeline) = self.pipeline() {
            pipeline.apply_media_types(types);
        }
    }

    pub fn duration(&self) -> f64 {
        self.pipeline().map_or(0.0, |p| p.duration())
    }

    /// Current playback position in seconds.
    pub fn current_time(&self) -> f64 {
        self.pipeline().map_or(0.0, |p| p.current_time())
    }

    pub fn source_info(&self) -> Option<SourceInfo> {
        self.pipeline().map(|p| p.info().clone())
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let Some(p) = self.pipeline() else {
            return SessionStatus {
                state,
                ..SessionStatus::default()
            };
        };
        let real = p.real_media_types();
        SessionStatus {
            state,
            position_secs: p.current_time(),
            duration_secs: p.duration(),
            buffering: p.is_buffering(),
            seeking: p.is_seeking(),
            paused: p.is_user_paused(),
            audio_master: p.master_is_audio(),
            has_video: real.video,
            has_audio: real.audio,
            has_subtitle: real.subtitle,
            video_frames_buffered: p.frames_buffered(MediaType::Video),
            audio_frames_buffered: p.frames_buffered(MediaType::Audio),
            end_reason: p.end_reason(),
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
        self.wait_stopped();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
