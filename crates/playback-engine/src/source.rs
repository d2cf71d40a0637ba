//! Symphonia-backed demuxer and audio codecs.
//!
//! Uses Symphonia to:
//! - probe the container and enumerate its tracks ([`SymphoniaOpener`])
//! - hand out compressed packets in container order ([`SymphoniaDemuxer`])
//! - decode packets into interleaved `f32` frames ([`SymphoniaCodecs`])
//!
//! Symphonia only decodes audio, so every stream surfaced here is an audio stream.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{self as sym_codecs, CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::CodecError;
use crate::frame::{
    AudioFormat, AudioFrame, CompressedPacket, DecodedFrame, FrameBuffer, MediaType, SampleFormat,
    TimeBase,
};
use crate::media::{
    Codec, CodecParameters, CodecProvider, Demuxer, ReadOutcome, Receive, SourceInfo,
    SourceOpener, StreamInfo, Submit,
};

/// Opens local files (plain paths or `file://` URLs).
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaOpener;

impl SourceOpener for SymphoniaOpener {
    fn open(&self, location: &str, abort: &AtomicBool) -> Result<Box<dyn Demuxer>> {
        let path = Path::new(location.strip_prefix("file://").unwrap_or(location));
        if abort.load(Ordering::Acquire) {
            bail!("open aborted");
        }
        let file = File::open(path).with_context(|| format!("open {path:?}"))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .with_context(|| format!("probe {path:?}"))?;
        if abort.load(Ordering::Acquire) {
            bail!("open aborted");
        }

        let demuxer = SymphoniaDemuxer::new(probed.format)?;
        tracing::debug!(
            path = %path.display(),
            streams = demuxer.info.streams.len(),
            duration_secs = demuxer.info.duration_secs,
            "probed"
        );
        Ok(Box::new(demuxer))
    }
}

/// A probed container.
pub struct SymphoniaDemuxer {
    format: Box<dyn FormatReader>,
    info: SourceInfo,
    /// Symphonia track id per stream index.
    track_ids: Vec<u32>,
}

impl SymphoniaDemuxer {
    pub fn new(format: Box<dyn FormatReader>) -> Result<Self> {
        let mut streams = Vec::new();
        let mut track_ids = Vec::new();
        let mut duration_secs = 0.0f64;

        for track in format.tracks() {
            let params = &track.codec_params;
            if params.codec == CODEC_TYPE_NULL {
                continue;
            }
            let Some(sample_rate) = params.sample_rate else {
                tracing::debug!(track = track.id, "skipping track without sample rate");
                continue;
            };
            let channels = params.channels.map_or(0, |c| c.count());
            if channels == 0 {
                tracing::debug!(track = track.id, "skipping track without channel layout");
                continue;
            }

            let time_base = params
                .time_base
                .map(|tb| TimeBase::new(tb.numer, tb.denom))
                .unwrap_or(TimeBase::new(1, sample_rate));
            if let Some(secs) = duration_secs_from_params(params) {
                duration_secs = duration_secs.max(secs);
            }

            streams.push(StreamInfo {
                index: streams.len(),
                media_type: MediaType::Audio,
                time_base,
                params: CodecParameters {
                    codec_name: codec_name_from_params(params),
                    audio_format: Some(AudioFormat {
                        sample_rate,
                        channels: channels as u16,
                        sample_format: SampleFormat::F32,
                    }),
                    width: None,
                    height: None,
                    backend: Some(Arc::new(params.clone())),
                },
            });
            track_ids.push(track.id);
        }

        if streams.is_empty() {
            return Err(anyhow!("no decodable track"));
        }
        Ok(Self {
            format,
            info: SourceInfo {
                streams,
                duration_secs,
            },
            track_ids,
        })
    }

    fn stream_index(&self, track_id: u32) -> Option<usize> {
        self.track_ids.iter().position(|&id| id == track_id)
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(ReadOutcome::EndOfStream);
                }
                Err(e) => return Err(anyhow!(e).context("read packet")),
            };
            // Tracks we did not expose are skipped.
            let Some(stream_index) = self.stream_index(packet.track_id()) else {
                continue;
            };
            return Ok(ReadOutcome::Packet(CompressedPacket {
                stream_index,
                pts: i64::try_from(packet.ts()).unwrap_or(i64::MAX),
                duration: packet.dur(),
                data: packet.buf().to_vec(),
            }));
        }
    }

    fn seek(&mut self, stream_index: usize, ts: i64) -> Result<()> {
        let track_id = *self
            .track_ids
            .get(stream_index)
            .ok_or_else(|| anyhow!("no stream {stream_index}"))?;
        let seeked = self
            .format
            .seek(
                SeekMode::Coarse,
                SeekTo::TimeStamp {
                    ts: ts.max(0) as u64,
                    track_id,
                },
            )
            .context("seek")?;
        tracing::debug!(
            stream_index,
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            "container repositioned"
        );
        Ok(())
    }
}

/// Codec factory for streams produced by [`SymphoniaDemuxer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaCodecs;

impl CodecProvider for SymphoniaCodecs {
    fn open(&self, stream: &StreamInfo) -> Result<Box<dyn Codec>, CodecError> {
        let params = stream
            .params
            .backend
            .as_ref()
            .and_then(|b| b.downcast_ref::<sym_codecs::CodecParameters>())
            .ok_or_else(|| CodecError::Unavailable("stream was not probed by symphonia".into()))?;

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(what) => CodecError::Unavailable(what.to_string()),
                other => CodecError::OpenFailed(other.to_string()),
            })?;

        Ok(Box::new(SymphoniaCodec {
            decoder,
            time_base: stream.time_base,
            pending: None,
            samples: None,
        }))
    }
}

/// One Symphonia decoder. Every packet yields at most one frame.
struct SymphoniaCodec {
    decoder: Box<dyn sym_codecs::Decoder>,
    time_base: TimeBase,
    pending: Option<DecodedFrame>,
    /// Reused conversion buffer with the signal spec and frame capacity it was built for.
    samples: Option<(SignalSpec, usize, SampleBuffer<f32>)>,
}

impl Codec for SymphoniaCodec {
    fn submit(&mut self, packet: &CompressedPacket) -> Result<Submit, CodecError> {
        if self.pending.is_some() {
            return Ok(Submit::Busy);
        }
        let ts = u64::try_from(packet.pts).unwrap_or(0);
        let sym_packet = Packet::new_from_slice(0, ts, packet.duration, &packet.data);

        let decoded = match self.decoder.decode(&sym_packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => return Err(CodecError::Decode(msg.into())),
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                return Err(CodecError::Decode("decoder reset required".into()));
            }
            Err(e) => return Err(CodecError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(Submit::Accepted);
        }
        let capacity = decoded.capacity();
        let stale = self
            .samples
            .as_ref()
            .is_none_or(|(held, held_capacity, _)| *held != spec || *held_capacity < capacity);
        if stale {
            self.samples = Some((spec, capacity, SampleBuffer::<f32>::new(capacity as u64, spec)));
        }
        let Some((_, _, buf)) = self.samples.as_mut() else {
            return Ok(Submit::Accepted);
        };
        buf.copy_interleaved_ref(decoded);

        let bytes: Vec<u8> = buf.samples().iter().flat_map(|s| s.to_ne_bytes()).collect();
        self.pending = Some(DecodedFrame::Audio(AudioFrame {
            pts: packet.pts,
            time_base: self.time_base,
            format: AudioFormat {
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
                sample_format: SampleFormat::F32,
            },
            samples: frames,
            buffer: FrameBuffer::new(bytes),
        }));
        Ok(Submit::Accepted)
    }

    fn receive(&mut self) -> Result<Receive, CodecError> {
        Ok(match self.pending.take() {
            Some(frame) => Receive::Frame(frame),
            None => Receive::NeedMoreInput,
        })
    }

    fn flush_internal_buffers(&mut self) {
        self.pending = None;
        self.decoder.reset();
    }
}

/// Best-effort duration in seconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_secs_from_params(params: &sym_codecs::CodecParameters) -> Option<f64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

/// Best-effort codec label used for logs and status.
fn codec_name_from_params(params: &sym_codecs::CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
