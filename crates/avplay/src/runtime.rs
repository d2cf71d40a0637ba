//! Command runners: device listing, probing and interactive playback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, select};
use playback_engine::media::{AudioResampler, ResamplerFactory};
use playback_engine::playback::{PlaybackConfig, build_pull_stream};
use playback_engine::resample::RubatoResampler;
use playback_engine::{
    AudioFormat, MediaType, PlaybackSession, SessionEvent, SessionState, SourceInfo,
    SourceOpener, SymphoniaCodecs, SymphoniaOpener, VideoPicture, VideoRenderer, device,
};
use tracing_subscriber::EnvFilter;

use crate::config::{OutputConfig, PlayConfig};
use crate::controls::{self, Control};
use crate::output;

/// Install the global tracing subscriber (`RUST_LOG` overrides the default filter).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,avplay=info,playback_engine=info")
        }))
        .init();
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Open `path` without decoding anything.
pub fn probe(path: &std::path::Path) -> Result<SourceInfo> {
    let location = path.to_string_lossy();
    let demuxer = SymphoniaOpener
        .open(&location, &AtomicBool::new(false))
        .with_context(|| format!("probe {}", path.display()))?;
    Ok(demuxer.info().clone())
}

pub fn run_probe(path: &std::path::Path) -> Result<()> {
    let info = probe(path)?;
    println!("{}", output::format_probe(&info));
    Ok(())
}

/// Counts pictures handed over by the display thread. The CLI has no window.
#[derive(Default)]
struct FrameCounter {
    presented: AtomicU64,
}

impl VideoRenderer for FrameCounter {
    fn present(&self, picture: &VideoPicture<'_>) {
        self.presented.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pts = picture.pts_secs, width = picture.width, height = picture.height, "video frame");
    }
}

/// Output device chosen for a source audio format.
struct AudioOutput {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    format: AudioFormat,
}

impl AudioOutput {
    fn open(name: Option<&str>, source: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, name)?;
        let supported = device::pick_output_config(&device, Some(source.sample_rate))?;
        let format = device::engine_format(&supported)
            .with_context(|| format!("device sample format {:?}", supported.sample_format()))?;
        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buf) = device::pick_buffer_size(&supported) {
            stream_config.buffer_size = buf;
        }
        tracing::info!(device = %device.description()?, "output device");
        tracing::info!(
            source_rate_hz = source.sample_rate,
            output_rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            buffer_size = ?stream_config.buffer_size,
            "device output config"
        );
        Ok(Self {
            device,
            stream_config,
            sample_format: supported.sample_format(),
            format,
        })
    }
}

fn resampler_factory(chunk_frames: usize) -> Arc<ResamplerFactory> {
    Arc::new(
        move |source: AudioFormat, output: AudioFormat| -> Result<Box<dyn AudioResampler>> {
            Ok(Box::new(RubatoResampler::with_chunk_frames(source, output, chunk_frames)?))
        },
    )
}

fn build_session(
    output: &OutputConfig,
    audio: Option<&AudioOutput>,
    renderer: Arc<FrameCounter>,
    events: crossbeam_channel::Sender<SessionEvent>,
) -> PlaybackSession {
    let mut builder = PlaybackSession::builder(Arc::new(SymphoniaOpener), Arc::new(SymphoniaCodecs))
        .config(output.engine.clone())
        .renderer(renderer)
        .resampler_factory(resampler_factory(output.chunk_frames))
        .observer(Arc::new(events));
    if let Some(audio) = audio {
        let format = audio.format;
        builder = builder.negotiator(move |_| format);
    }
    builder.build()
}

/// Play one file until it finishes or the user quits.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let location = config.path.to_string_lossy().into_owned();
    let info = probe(&config.path)?;
    let source_audio = info
        .first_of(MediaType::Audio)
        .and_then(|s| s.params.audio_format)
        .filter(|_| config.media_types().audio);
    let audio = source_audio
        .map(|fmt| AudioOutput::open(config.output.device.as_deref(), fmt))
        .transpose()?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let renderer = Arc::new(FrameCounter::default());
    let session = build_session(&config.output, audio.as_ref(), Arc::clone(&renderer), event_tx);

    let ctrlc_tx = control_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Control::Quit);
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    session.open(&location)?;

    let underrun_events = Arc::new(AtomicU64::new(0));
    let stream = match &audio {
        Some(out) => {
            let stream = build_pull_stream(
                &out.device,
                &out.stream_config,
                out.sample_format,
                session.audio_pull(),
                PlaybackConfig {
                    underrun_events: Some(Arc::clone(&underrun_events)),
                    ..PlaybackConfig::default()
                },
            )?;
            stream.play()?;
            Some(stream)
        }
        None => None,
    };

    session.play()?;
    if config.start_secs > 0.0 {
        session.seek_to(config.start_secs)?;
    }
    controls::spawn_stdin_reader(control_tx).context("spawn stdin reader")?;
    eprintln!("{}", controls::HELP);

    let result = drive(&session, &event_rx, &control_rx, config.json);

    session.stop();
    session.wait_stopped();
    drop(stream);
    tracing::info!(
        video_frames = renderer.presented.load(Ordering::Relaxed),
        underruns = underrun_events.load(Ordering::Relaxed),
        "playback ended"
    );
    result
}

/// Print events and apply stdin commands until the session finishes.
fn drive(
    session: &PlaybackSession,
    events: &Receiver<SessionEvent>,
    controls: &Receiver<Control>,
    json: bool,
) -> Result<()> {
    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { return Ok(()) };
                println!("{}", output::format_event(&event, json));
                if matches!(event, SessionEvent::Finished { .. }) {
                    return Ok(());
                }
            }
            recv(controls) -> control => {
                let Ok(control) = control else { continue };
                if matches!(control, Control::Quit) {
                    session.stop();
                    continue;
                }
                if let Err(e) = apply(session, control, json) {
                    eprintln!("{e}");
                }
            }
            default(Duration::from_secs(1)) => {
                if session.state() == SessionState::Idle {
                    return Ok(());
                }
            }
        }
    }
}

fn apply(session: &PlaybackSession, control: Control, json: bool) -> Result<()> {
    match control {
        Control::TogglePause => {
            let paused = session.status().paused;
            session.pause(!paused)?;
        }
        Control::SeekTo(secs) => session.seek_to(secs)?,
        Control::SeekBy(interval) => session.seek_by(interval)?,
        Control::Status => println!("{}", output::format_status(&session.status(), json)),
        Control::Quit => session.stop(),
    }
    Ok(())
}
