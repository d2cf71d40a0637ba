//! Device output stage (CPAL output stream).
//!
//! Builds the CPAL output stream and provides the real-time audio callback.
//! The callback:
//! - asks the session's [`AudioPull`] for exactly one device buffer of bytes
//! - reinterprets those bytes as the device sample type
//! - counts produced and missing frames when counters are wired in
//!
//! The pull side already speaks the device format: the session negotiated it through
//! [`crate::device::engine_format`] and converts decoded audio before it gets here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::display::AudioPull;

/// Optional counters updated from the output callback.
#[derive(Clone, Debug, Default)]
pub struct PlaybackConfig {
    /// Incremented by the number of frames that carried real audio.
    pub played_frames: Option<Arc<AtomicU64>>,

    /// Incremented when the callback had to pad with silence.
    pub underrun_frames: Option<Arc<AtomicU64>>,
    pub underrun_events: Option<Arc<AtomicU64>>,
}

/// Build a CPAL output stream fed by `pull`.
///
/// `sample_format` must be the format `pull` produces; the stream fails to build for
/// formats the engine cannot produce.
pub fn build_pull_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    pull: AudioPull,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, pull, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, pull, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, pull, cfg),
        cpal::SampleFormat::U8 => build_stream::<u8>(device, config, pull, cfg),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

/// Device sample types the engine can produce, with their native-endian byte width.
trait PcmSample: cpal::SizedSample + Send + 'static {
    const BYTES: usize;
    fn from_ne(bytes: &[u8]) -> Self;
}

impl PcmSample for f32 {
    const BYTES: usize = 4;
    fn from_ne(b: &[u8]) -> Self {
        f32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl PcmSample for i32 {
    const BYTES: usize = 4;
    fn from_ne(b: &[u8]) -> Self {
        i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl PcmSample for i16 {
    const BYTES: usize = 2;
    fn from_ne(b: &[u8]) -> Self {
        i16::from_ne_bytes([b[0], b[1]])
    }
}

impl PcmSample for u8 {
    const BYTES: usize = 1;
    fn from_ne(b: &[u8]) -> Self {
        b[0]
    }
}

fn build_stream<T: PcmSample>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    pull: AudioPull,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    let channels_out = (config.channels as usize).max(1);
    let mut scratch: Vec<u8> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            scratch.resize(data.len() * T::BYTES, 0);
            let filled = pull.fill(&mut scratch).min(scratch.len());
            let samples = filled / T::BYTES;
            copy_samples(&scratch[..samples * T::BYTES], &mut data[..samples]);
            data[samples..].fill(<T as cpal::Sample>::EQUILIBRIUM);

            let frames = data.len() / channels_out;
            let played = filled / (T::BYTES * channels_out);
            if let Some(counter) = &cfg.played_frames {
                counter.fetch_add(played as u64, Ordering::Relaxed);
            }
            if played < frames {
                if let Some(events) = &cfg.underrun_events {
                    events.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(counter) = &cfg.underrun_frames {
                    counter.fetch_add((frames - played) as u64, Ordering::Relaxed);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Reinterpret native-endian `bytes` as samples.
fn copy_samples<T: PcmSample>(bytes: &[u8], out: &mut [T]) {
    for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(T::BYTES)) {
        *dst = T::from_ne(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_samples_reads_native_endian_values() {
        let bytes: Vec<u8> = [0.5f32, -0.25].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut out = [0.0f32; 2];
        copy_samples(&bytes, &mut out);
        assert_eq!(out, [0.5, -0.25]);

        let bytes: Vec<u8> = [1000i16, -2].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut out = [0i16; 2];
        copy_samples(&bytes, &mut out);
        assert_eq!(out, [1000, -2]);
    }

    #[test]
    fn detached_pull_yields_nothing() {
        let pull = AudioPull::default();
        let mut scratch = vec![7u8; 16];
        assert_eq!(pull.fill(&mut scratch), 0);
        assert!(scratch.iter().all(|&b| b == 0));
        assert_eq!(<u8 as cpal::Sample>::EQUILIBRIUM, 128);
    }
}
