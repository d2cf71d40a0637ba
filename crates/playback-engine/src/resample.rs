//! Streaming audio conversion into the format the output device adopted.
//!
//! Uses Rubato to convert sample rates. Channel remapping and sample-format conversion
//! happen around it. Input is buffered internally until a full chunk is available, so a
//! single call may produce nothing; leftovers are dropped by [`AudioResampler::reset`].

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::frame::{AudioFormat, AudioFrame, SampleFormat};
use crate::media::AudioResampler;

/// Converts decoded frames of one source format into one output format.
pub struct RubatoResampler {
    source: AudioFormat,
    output: AudioFormat,
    /// `None` when the rates match and only channels/sample format change.
    rate: Option<RateStage>,
    /// Interleaved `f32` at the source rate and output channel count.
    mixed: Vec<f32>,
}

struct RateStage {
    resampler: Async<f32>,
    chunk_frames: usize,
    channels: usize,
    /// Input waiting for a full chunk.
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl RubatoResampler {
    /// Input chunk size in frames for the sinc resampler.
    ///
    /// Larger values reduce per-call overhead at the cost of latency.
    pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

    pub fn new(source: AudioFormat, output: AudioFormat) -> Result<Self> {
        Self::with_chunk_frames(source, output, Self::DEFAULT_CHUNK_FRAMES)
    }

    pub fn with_chunk_frames(source: AudioFormat, output: AudioFormat, chunk_frames: usize) -> Result<Self> {
        if source.sample_rate == 0 || output.sample_rate == 0 {
            return Err(anyhow!("sample rate must be non-zero"));
        }
        if source.channels == 0 || output.channels == 0 {
            return Err(anyhow!("channel count must be non-zero"));
        }
        let rate = if source.sample_rate != output.sample_rate {
            Some(RateStage::new(
                source.sample_rate,
                output.sample_rate,
                output.channels as usize,
                chunk_frames.max(1),
            )?)
        } else {
            None
        };
        tracing::debug!(?source, ?output, resampling = rate.is_some(), "audio converter ready");
        Ok(Self {
            source,
            output,
            rate,
            mixed: Vec::new(),
        })
    }

    pub fn source_format(&self) -> AudioFormat {
        self.source
    }
}

impl RateStage {
    fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;

        let out_frames = (chunk_frames as f64 * f_ratio * 1.1).ceil() as usize + sinc_len;
        Ok(Self {
            resampler,
            chunk_frames,
            channels,
            pending: Vec::new(),
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Push `input` and append every completed output chunk to `produced`.
    fn process(&mut self, input: &[f32], produced: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;

        while self.pending.len() - consumed >= chunk_samples {
            let chunk = &self.pending[consumed..consumed + chunk_samples];
            let input_adapter = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
                .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;

            let out_capacity_frames = self.out.len() / self.channels;
            let mut output_adapter =
                InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
                    .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

            self.indexing.input_offset = 0;
            self.indexing.output_offset = 0;
            self.indexing.partial_len = None;

            let (_nbr_in, nbr_out) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
                .map_err(|e| anyhow!("resampler process: {e}"))?;

            produced.extend_from_slice(&self.out[..nbr_out * self.channels]);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}

impl AudioResampler for RubatoResampler {
    fn output_format(&self) -> AudioFormat {
        self.output
    }

    fn resample(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<()> {
        if frame.format != self.source {
            return Err(anyhow!(
                "frame format {:?} does not match converter input {:?}",
                frame.format,
                self.source
            ));
        }
        let samples = decode_samples(frame.data(), frame.format.sample_format);
        self.mixed.clear();
        remix(
            &samples,
            self.source.channels as usize,
            self.output.channels as usize,
            &mut self.mixed,
        );

        match self.rate.as_mut() {
            Some(stage) => {
                let mut resampled = Vec::new();
                stage.process(&self.mixed, &mut resampled)?;
                encode_samples(&resampled, self.output.sample_format, out);
            }
            None => encode_samples(&self.mixed, self.output.sample_format, out),
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(stage) = self.rate.as_mut() {
            stage.reset();
        }
    }
}

/// Interleaved bytes in `format` → `f32` in `[-1, 1]`.
fn decode_samples(bytes: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        SampleFormat::I32 => bytes
            .chunks_exact(4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0)
            .collect(),
        SampleFormat::I16 => bytes
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]) as f32 / 32_768.0)
            .collect(),
        SampleFormat::U8 => bytes.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
    }
}

fn encode_samples(samples: &[f32], format: SampleFormat, out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes_per_sample());
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        match format {
            SampleFormat::F32 => out.extend_from_slice(&s.to_ne_bytes()),
            SampleFormat::I32 => out.extend_from_slice(&((s as f64 * 2_147_483_647.0) as i32).to_ne_bytes()),
            SampleFormat::I16 => out.extend_from_slice(&((s * 32_767.0) as i16).to_ne_bytes()),
            SampleFormat::U8 => out.push((s * 127.0 + 128.0) as u8),
        }
    }
}

/// Map `src_channels` interleaved input onto `dst_channels`.
///
/// Mono fans out to every output channel; anything folded down to mono is averaged.
/// Otherwise channels are matched by position and missing ones repeat the last input.
fn remix(input: &[f32], src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
    if src_channels == dst_channels {
        out.extend_from_slice(input);
        return;
    }
    for frame in input.chunks_exact(src_channels) {
        if dst_channels == 1 {
            out.push(frame.iter().sum::<f32>() / src_channels as f32);
            continue;
        }
        for ch in 0..dst_channels {
            out.push(frame[ch.min(src_channels - 1)]);
        }
    }
}
