//! Scripted collaborators shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::error::CodecError;
use crate::gate::Gate;
use crate::frame::{
    AudioFormat, AudioFrame, CompressedPacket, DecodedFrame, FrameBuffer, MediaType, PixelFormat,
    PlaneLayout, SampleFormat, SubtitleFrame, TimeBase, VideoFrame,
};
use crate::media::{
    Codec, CodecParameters, CodecProvider, Demuxer, ReadOutcome, Receive, SourceInfo,
    SourceOpener, StreamInfo, Submit, VideoPicture, VideoRenderer,
};

pub(crate) const MS: TimeBase = TimeBase::new(1, 1000);

/// 1 kHz mono f32: one sample per millisecond, four bytes each.
pub(crate) const AUDIO_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 1000,
    channels: 1,
    sample_format: SampleFormat::F32,
};

pub(crate) fn audio_stream(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        media_type: MediaType::Audio,
        time_base: MS,
        params: CodecParameters {
            codec_name: Some("scripted".into()),
            audio_format: Some(AUDIO_FORMAT),
            ..CodecParameters::default()
        },
    }
}

pub(crate) fn video_stream(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        media_type: MediaType::Video,
        time_base: MS,
        params: CodecParameters {
            codec_name: Some("scripted".into()),
            width: Some(4),
            height: Some(4),
            ..CodecParameters::default()
        },
    }
}

pub(crate) fn subtitle_stream(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        media_type: MediaType::Subtitle,
        time_base: MS,
        params: CodecParameters::default(),
    }
}

pub(crate) fn packet(stream_index: usize, pts: i64, duration: u64) -> CompressedPacket {
    CompressedPacket {
        stream_index,
        pts,
        duration,
        data: vec![0xAB; 8],
    }
}

/// Audio frame of `samples` milliseconds whose bytes encode their own position.
pub(crate) fn audio_frame(pts: i64, samples: usize) -> DecodedFrame {
    let len = samples * AUDIO_FORMAT.bytes_per_frame();
    let bytes = (0..len).map(|i| (pts as usize * 4 + i) as u8).collect();
    DecodedFrame::Audio(AudioFrame {
        pts,
        time_base: MS,
        format: AUDIO_FORMAT,
        samples,
        buffer: FrameBuffer::new(bytes),
    })
}

/// 4x4 YUV 4:2:0 picture.
pub(crate) fn video_frame(pts: i64) -> DecodedFrame {
    DecodedFrame::Video(VideoFrame {
        pts,
        time_base: MS,
        width: 4,
        height: 4,
        format: PixelFormat::Yuv420p,
        planes: vec![
            PlaneLayout { offset: 0, stride: 4, rows: 4 },
            PlaneLayout { offset: 16, stride: 2, rows: 2 },
            PlaneLayout { offset: 20, stride: 2, rows: 2 },
        ],
        buffer: FrameBuffer::new(vec![pts as u8; 24]),
    })
}

fn subtitle_frame(pts: i64, duration: u64) -> DecodedFrame {
    DecodedFrame::Subtitle(SubtitleFrame {
        pts,
        time_base: MS,
        duration,
        buffer: FrameBuffer::new(b"line".to_vec()),
    })
}

#[derive(Clone, Debug, Default)]
pub(crate) enum CodecScript {
    /// One frame per packet, same pts.
    #[default]
    PassThrough,
    /// Submission `i` releases frames with the listed pts (empty = held back).
    /// Submissions past the end behave like `PassThrough`.
    Batches(Vec<Vec<i64>>),
}

#[derive(Default)]
pub(crate) struct CodecStats {
    submitted: AtomicUsize,
    flushes: AtomicUsize,
}

impl CodecStats {
    pub(crate) fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedCodecs {
    audio: CodecScript,
    video: CodecScript,
    failing: Option<(MediaType, CodecError)>,
    busy_submits: usize,
    stats: Arc<CodecStats>,
}

impl ScriptedCodecs {
    pub(crate) fn audio(mut self, script: CodecScript) -> Self {
        self.audio = script;
        self
    }

    pub(crate) fn video(mut self, script: CodecScript) -> Self {
        self.video = script;
        self
    }

    pub(crate) fn failing(mut self, media: MediaType, err: CodecError) -> Self {
        self.failing = Some((media, err));
        self
    }

    /// The first `n` submits report `Busy`.
    pub(crate) fn busy_submits(mut self, n: usize) -> Self {
        self.busy_submits = n;
        self
    }

    pub(crate) fn stats(&self) -> &Arc<CodecStats> {
        &self.stats
    }
}

impl CodecProvider for ScriptedCodecs {
    fn open(&self, stream: &StreamInfo) -> Result<Box<dyn Codec>, CodecError> {
        if let Some((media, err)) = &self.failing {
            if *media == stream.media_type {
                return Err(err.clone());
            }
        }
        let script = match stream.media_type {
            MediaType::Video => self.video.clone(),
            _ => self.audio.clone(),
        };
        Ok(Box::new(ScriptedCodec {
            media_type: stream.media_type,
            script,
            submissions: 0,
            busy_remaining: self.busy_submits,
            pending: VecDeque::new(),
            last: None,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct ScriptedCodec {
    media_type: MediaType,
    script: CodecScript,
    submissions: usize,
    busy_remaining: usize,
    pending: VecDeque<DecodedFrame>,
    /// Reference the codec keeps to its most recent output.
    last: Option<DecodedFrame>,
    stats: Arc<CodecStats>,
}

impl ScriptedCodec {
    fn make_frame(&self, pts: i64, duration: u64) -> DecodedFrame {
        match self.media_type {
            MediaType::Audio => audio_frame(pts, duration.max(1) as usize),
            MediaType::Video => video_frame(pts),
            MediaType::Subtitle => subtitle_frame(pts, duration),
        }
    }
}

impl Codec for ScriptedCodec {
    fn submit(&mut self, packet: &CompressedPacket) -> Result<Submit, CodecError> {
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            return Ok(Submit::Busy);
        }
        let released = match &self.script {
            CodecScript::Batches(batches) if self.submissions < batches.len() => {
                batches[self.submissions].clone()
            }
            _ => vec![packet.pts],
        };
        self.submissions += 1;
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);

        for pts in released {
            let frame = self.make_frame(pts, packet.duration);
            self.pending.push_back(frame.duplicate());
            self.last = Some(frame);
        }
        Ok(Submit::Accepted)
    }

    fn receive(&mut self) -> Result<Receive, CodecError> {
        Ok(match self.pending.pop_front() {
            Some(frame) => Receive::Frame(frame),
            None => Receive::NeedMoreInput,
        })
    }

    fn flush_internal_buffers(&mut self) {
        self.pending.clear();
        self.last = None;
        self.stats.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory container with evenly spaced packets.
#[derive(Clone)]
pub(crate) struct ScriptedDemuxer {
    info: SourceInfo,
    packets: Vec<CompressedPacket>,
    cursor: usize,
    /// Packets whose pts is a multiple of this are seekable.
    keyframe_interval: i64,
    fail_seek: bool,
    /// Reading packet `n` waits for the gate (bounded, so a failing test cannot hang).
    hold: Option<(usize, Arc<Gate>)>,
    pub(crate) seeks: Arc<Mutex<Vec<(usize, i64)>>>,
}

impl ScriptedDemuxer {
    /// Single audio stream (index 0) of `duration_ms`, one packet per `packet_ms`.
    pub(crate) fn audio_only(duration_ms: i64, packet_ms: i64) -> Self {
        let packets = (0..duration_ms / packet_ms)
            .map(|i| packet(0, i * packet_ms, packet_ms as u64))
            .collect();
        Self::new(vec![audio_stream(0)], packets, duration_ms)
    }

    /// Audio on stream 0 and video on stream 1, interleaved by pts.
    pub(crate) fn audio_video(duration_ms: i64, audio_ms: i64, video_ms: i64) -> Self {
        let mut packets: Vec<CompressedPacket> = (0..duration_ms / audio_ms)
            .map(|i| packet(0, i * audio_ms, audio_ms as u64))
            .chain((0..duration_ms / video_ms).map(|i| packet(1, i * video_ms, video_ms as u64)))
            .collect();
        packets.sort_by_key(|p| (p.pts, p.stream_index));
        Self::new(vec![audio_stream(0), video_stream(1)], packets, duration_ms)
    }

    /// Video on stream 0 only.
    pub(crate) fn video_only(duration_ms: i64, video_ms: i64) -> Self {
        let packets = (0..duration_ms / video_ms)
            .map(|i| packet(0, i * video_ms, video_ms as u64))
            .collect();
        Self::new(vec![video_stream(0)], packets, duration_ms)
    }

    pub(crate) fn subtitles_only(duration_ms: i64) -> Self {
        Self::new(vec![subtitle_stream(0)], vec![packet(0, 0, duration_ms as u64)], duration_ms)
    }

    fn new(streams: Vec<StreamInfo>, packets: Vec<CompressedPacket>, duration_ms: i64) -> Self {
        Self {
            info: SourceInfo {
                streams,
                duration_secs: duration_ms as f64 / 1000.0,
            },
            packets,
            cursor: 0,
            keyframe_interval: 100,
            fail_seek: false,
            hold: None,
            seeks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn failing_seek(mut self) -> Self {
        self.fail_seek = true;
        self
    }

    /// Stop delivering at packet `index` until the returned gate opens.
    pub(crate) fn hold_at(mut self, index: usize) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::new(false));
        self.hold = Some((index, Arc::clone(&gate)));
        (self, gate)
    }
}

impl Demuxer for ScriptedDemuxer {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if let Some((index, gate)) = &self.hold {
            if self.cursor == *index {
                gate.wait_timeout(Duration::from_secs(5));
            }
        }
        match self.packets.get(self.cursor) {
            Some(p) => {
                self.cursor += 1;
                Ok(ReadOutcome::Packet(p.clone()))
            }
            None => Ok(ReadOutcome::EndOfStream),
        }
    }

    fn seek(&mut self, stream_index: usize, ts: i64) -> Result<()> {
        self.seeks.lock().unwrap().push((stream_index, ts));
        if self.fail_seek {
            bail!("seek not supported");
        }
        let target = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.stream_index == stream_index && p.pts <= ts && p.pts % self.keyframe_interval == 0
            })
            .map(|(i, p)| (i, p.pts))
            .last();
        // Land on the first packet of any stream at the keyframe's pts.
        self.cursor = match target {
            Some((i, pts)) => self.packets[..i]
                .iter()
                .rposition(|p| p.pts < pts)
                .map_or(0, |j| j + 1),
            None => 0,
        };
        Ok(())
    }
}

pub(crate) struct ScriptedOpener {
    demuxer: ScriptedDemuxer,
    fail: bool,
    block_until_abort: bool,
}

impl ScriptedOpener {
    pub(crate) fn new(demuxer: ScriptedDemuxer) -> Self {
        Self {
            demuxer,
            fail: false,
            block_until_abort: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(ScriptedDemuxer::audio_only(0, 10))
        }
    }

    pub(crate) fn blocking() -> Self {
        Self {
            block_until_abort: true,
            ..Self::new(ScriptedDemuxer::audio_only(1000, 10))
        }
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, location: &str, abort: &AtomicBool) -> Result<Box<dyn Demuxer>> {
        if self.fail {
            return Err(anyhow!("no such file: {location}"));
        }
        if self.block_until_abort {
            while !abort.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
        }
        if abort.load(Ordering::SeqCst) {
            bail!("open aborted");
        }
        Ok(Box::new(self.demuxer.clone()))
    }
}

/// Records `(pts_secs, height, first plane length)` of every presented picture.
#[derive(Default)]
pub(crate) struct RecordingRenderer {
    pub(crate) presented: Mutex<Vec<(f64, u32, usize)>>,
}

impl RecordingRenderer {
    pub(crate) fn pts(&self) -> Vec<f64> {
        self.presented.lock().unwrap().iter().map(|p| p.0).collect()
    }
}

impl VideoRenderer for RecordingRenderer {
    fn present(&self, picture: &VideoPicture<'_>) {
        let first = picture.planes.first().map_or(0, |p| p.len());
        self.presented
            .lock()
            .unwrap()
            .push((picture.pts_secs, picture.height, first));
    }
}
