//! Collaborator contracts: demuxer, codec, renderer, resampler and host observer.
//!
//! The engine drives these from its own threads. Implementations only need to be
//! `Send`; the engine serializes access to each instance.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use playback_types::SessionEvent;

use crate::error::CodecError;
use crate::frame::{AudioFormat, AudioFrame, CompressedPacket, DecodedFrame, MediaType, PixelFormat, TimeBase};

/// Codec description attached to a stream.
#[derive(Clone, Default)]
pub struct CodecParameters {
    /// Codec label (best-effort, for logs and status).
    pub codec_name: Option<String>,
    /// Source PCM layout for audio streams.
    pub audio_format: Option<AudioFormat>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Backend-specific parameters, downcast by the matching [`CodecProvider`].
    pub backend: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecParameters")
            .field("codec_name", &self.codec_name)
            .field("audio_format", &self.audio_format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub time_base: TimeBase,
    pub params: CodecParameters,
}

/// Result of probing a source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    pub streams: Vec<StreamInfo>,
    /// Total duration in seconds (0 when unknown).
    pub duration_secs: f64,
}

impl SourceInfo {
    /// First stream of the given media type.
    pub fn first_of(&self, media_type: MediaType) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.media_type == media_type)
    }
}

pub enum ReadOutcome {
    Packet(CompressedPacket),
    EndOfStream,
}

/// An opened container.
pub trait Demuxer: Send {
    fn info(&self) -> &SourceInfo;

    /// Next packet in container order. Errors are transient: the read loop logs and
    /// moves on.
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    /// Reposition to the nearest keyframe at or before `ts` (in `stream_index` units).
    fn seek(&mut self, stream_index: usize, ts: i64) -> Result<()>;
}

/// Opens a location into a [`Demuxer`].
pub trait SourceOpener: Send + Sync {
    /// `abort` is raised by `cancel_open`; openers that block for long should poll it.
    fn open(&self, location: &str, abort: &AtomicBool) -> Result<Box<dyn Demuxer>>;
}

pub enum Submit {
    Accepted,
    /// Output must be drained before more input is accepted.
    Busy,
}

pub enum Receive {
    Frame(DecodedFrame),
    /// The decoder needs more input before it can emit another frame.
    NeedMoreInput,
    EndOfStream,
}

/// Per-stream decoder handle.
pub trait Codec: Send {
    fn submit(&mut self, packet: &CompressedPacket) -> std::result::Result<Submit, CodecError>;
    fn receive(&mut self) -> std::result::Result<Receive, CodecError>;
    /// Drop frames held for reordering so nothing stale leaks past a flush.
    fn flush_internal_buffers(&mut self);
}

pub trait CodecProvider: Send + Sync {
    fn open(&self, stream: &StreamInfo) -> std::result::Result<Box<dyn Codec>, CodecError>;
}

/// Borrowed picture handed to the renderer.
#[derive(Debug)]
pub struct VideoPicture<'a> {
    pub planes: Vec<&'a [u8]>,
    pub strides: Vec<usize>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation time in seconds.
    pub pts_secs: f64,
}

/// Host video output. Called from the display thread.
pub trait VideoRenderer: Send + Sync {
    fn present(&self, picture: &VideoPicture<'_>);
}

/// Converts decoded audio into the adopted output format.
pub trait AudioResampler: Send {
    fn output_format(&self) -> AudioFormat;

    fn needs_resample(&self, frame: &AudioFrame) -> bool {
        frame.format != self.output_format()
    }

    /// Append `frame` converted to [`AudioResampler::output_format`] to `out`.
    ///
    /// Streaming resamplers may buffer input internally and append nothing for a
    /// given call.
    fn resample(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<()>;

    /// Forget buffered input (after a flush).
    fn reset(&mut self);
}

/// Maps the source audio format to the format the output device adopts.
pub type FormatNegotiator = dyn Fn(AudioFormat) -> AudioFormat + Send + Sync;

/// Builds a resampler from `(source, output)` formats.
pub type ResamplerFactory =
    dyn Fn(AudioFormat, AudioFormat) -> Result<Box<dyn AudioResampler>> + Send + Sync;

/// Host notification sink.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl SessionObserver for crossbeam_channel::Sender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            tracing::debug!("session event dropped: receiver gone");
        }
    }
}

/// Observer that discards every event.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: SessionEvent) {}
}
