//! Units of data moving through the pipeline: compressed packets and decoded frames.
//!
//! Decoded frames own a reference-counted backing buffer. Taking a new reference
//! ([`DecodedFrame::duplicate`]) lets a codec reuse its own handle immediately while
//! the engine keeps the data alive; the last owner dropping its frame releases it.

use std::sync::Arc;

/// Rational scale converting integer timestamps of one stream into seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Timestamp in stream units → seconds (0 for an invalid time base).
    pub fn seconds(&self, ts: i64) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        ts as f64 * self.num as f64 / self.den as f64
    }

    /// Seconds → timestamp in stream units, truncated toward zero.
    pub fn timestamp(&self, secs: f64) -> i64 {
        if !self.is_valid() || !secs.is_finite() {
            return 0;
        }
        (secs * self.den as f64 / self.num as f64) as i64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

impl MediaType {
    pub fn label(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Subtitle => "subtitle",
        }
    }
}

/// Compressed data for one stream, as produced by the demuxer.
#[derive(Clone, Debug)]
pub struct CompressedPacket {
    pub stream_index: usize,
    /// Presentation timestamp in stream time-base units.
    pub pts: i64,
    /// Duration in stream time-base units (0 when unknown).
    pub duration: u64,
    pub data: Vec<u8>,
}

/// Shared, immutable backing storage of a decoded frame.
#[derive(Clone, Debug)]
pub struct FrameBuffer(Arc<[u8]>);

impl FrameBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take another reference to the same bytes.
    pub fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Nv21,
    Rgb32,
}

/// Placement of one picture plane inside a [`FrameBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    /// Bytes per row.
    pub stride: usize,
    pub rows: usize,
}

#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub pts: i64,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<PlaneLayout>,
    pub buffer: FrameBuffer,
}

impl VideoFrame {
    /// Bytes of plane `index`, or `None` when the layout points outside the buffer.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let layout = self.planes.get(index)?;
        let end = layout.offset.checked_add(layout.stride.checked_mul(layout.rows)?)?;
        self.buffer.as_slice().get(layout.offset..end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    F32,
    I16,
    I32,
    U8,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 | SampleFormat::I32 => 4,
            SampleFormat::I16 => 2,
            SampleFormat::U8 => 1,
        }
    }
}

/// Interleaved PCM layout descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Playback duration of `bytes` of interleaved audio in this format.
    pub fn duration_of(&self, bytes: usize) -> f64 {
        let per_frame = self.bytes_per_frame();
        if per_frame == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        (bytes / per_frame) as f64 / self.sample_rate as f64
    }
}

#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub pts: i64,
    pub time_base: TimeBase,
    pub format: AudioFormat,
    /// Samples per channel.
    pub samples: usize,
    /// Interleaved samples in `format`.
    pub buffer: FrameBuffer,
}

impl AudioFrame {
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }
}

#[derive(Clone, Debug)]
pub struct SubtitleFrame {
    pub pts: i64,
    pub time_base: TimeBase,
    /// Display duration in stream units (0 when unknown).
    pub duration: u64,
    pub buffer: FrameBuffer,
}

/// Decoded output of a codec, tagged by media type.
#[derive(Clone, Debug)]
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
    Subtitle(SubtitleFrame),
}

impl DecodedFrame {
    pub fn pts(&self) -> i64 {
        match self {
            DecodedFrame::Video(f) => f.pts,
            DecodedFrame::Audio(f) => f.pts,
            DecodedFrame::Subtitle(f) => f.pts,
        }
    }

    pub fn time_base(&self) -> TimeBase {
        match self {
            DecodedFrame::Video(f) => f.time_base,
            DecodedFrame::Audio(f) => f.time_base,
            DecodedFrame::Subtitle(f) => f.time_base,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            DecodedFrame::Video(_) => MediaType::Video,
            DecodedFrame::Audio(_) => MediaType::Audio,
            DecodedFrame::Subtitle(_) => MediaType::Subtitle,
        }
    }

    /// Presentation time in seconds.
    pub fn presentation_secs(&self) -> f64 {
        self.time_base().seconds(self.pts())
    }

    /// New owned frame referencing the same backing buffer.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        match self {
            DecodedFrame::Video(f) => &f.buffer,
            DecodedFrame::Audio(f) => &f.buffer,
            DecodedFrame::Subtitle(f) => &f.buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_base_converts_both_ways() {
        let tb = TimeBase::new(1, 90_000);
        assert_eq!(tb.seconds(180_000), 2.0);
        assert_eq!(tb.timestamp(2.5), 225_000);
    }

    #[test]
    fn invalid_time_base_yields_zero() {
        let tb = TimeBase::new(0, 1);
        assert_eq!(tb.seconds(1000), 0.0);
        assert_eq!(tb.timestamp(3.0), 0);
    }

    #[test]
    fn audio_format_duration_counts_whole_frames() {
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
        };
        assert_eq!(fmt.bytes_per_frame(), 8);
        assert_eq!(fmt.duration_of(48_000 * 8), 1.0);
        assert_eq!(fmt.duration_of(7), 0.0);
    }

    #[test]
    fn duplicate_shares_the_backing_buffer() {
        let frame = DecodedFrame::Audio(AudioFrame {
            pts: 10,
            time_base: TimeBase::new(1, 100),
            format: AudioFormat {
                sample_rate: 100,
                channels: 1,
                sample_format: SampleFormat::U8,
            },
            samples: 4,
            buffer: FrameBuffer::new(vec![1, 2, 3, 4]),
        });
        let copy = frame.duplicate();
        assert_eq!(frame.buffer().ref_count(), 2);
        drop(frame);
        assert_eq!(copy.buffer().ref_count(), 1);
        assert_eq!(copy.presentation_secs(), 0.1);
    }

    #[test]
    fn plane_rejects_out_of_range_layout() {
        let frame = VideoFrame {
            pts: 0,
            time_base: TimeBase::new(1, 25),
            width: 2,
            height: 2,
            format: PixelFormat::Rgb32,
            planes: vec![
                PlaneLayout { offset: 0, stride: 8, rows: 2 },
                PlaneLayout { offset: 8, stride: 8, rows: 2 },
            ],
            buffer: FrameBuffer::new(vec![0; 16]),
        };
        assert_eq!(frame.plane(0).map(|p| p.len()), Some(16));
        assert!(frame.plane(1).is_none());
        assert!(frame.plane(2).is_none());
    }
}
