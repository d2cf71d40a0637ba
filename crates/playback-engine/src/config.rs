use std::collections::HashMap;
use std::time::Duration;

use crate::frame::{MediaType, PixelFormat};

/// Set of media types selected for decoding and presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaTypes {
    pub video: bool,
    pub audio: bool,
    pub subtitle: bool,
}

impl MediaTypes {
    pub const ALL: MediaTypes = MediaTypes {
        video: true,
        audio: true,
        subtitle: true,
    };

    pub const NONE: MediaTypes = MediaTypes {
        video: false,
        audio: false,
        subtitle: false,
    };

    pub fn contains(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Video => self.video,
            MediaType::Audio => self.audio,
            MediaType::Subtitle => self.subtitle,
        }
    }

    pub fn intersect(&self, other: MediaTypes) -> MediaTypes {
        MediaTypes {
            video: self.video && other.video,
            audio: self.audio && other.audio,
            subtitle: self.subtitle && other.subtitle,
        }
    }
}

impl Default for MediaTypes {
    fn default() -> Self {
        MediaTypes::ALL
    }
}

/// Rows trimmed from decoded pictures before they reach the renderer.
///
/// Row counts are in luma rows; subsampled planes are trimmed proportionally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneCrop {
    pub top_rows: u32,
    pub bottom_rows: u32,
}

/// Engine tuning parameters shared by the session, decoders and display.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Compressed packets buffered per stream.
    pub packet_queue_capacity: usize,
    /// Decoded frames buffered per stream type.
    pub video_frame_queue_capacity: usize,
    pub audio_frame_queue_capacity: usize,
    pub subtitle_frame_queue_capacity: usize,
    /// Check-stream frame count at or below which the buffer counts as run out.
    pub buffer_empty_size: usize,
    /// Check-stream frame count at or above which buffering is healthy again.
    pub play_resume_size: usize,
    /// Pacing tolerance: waits shorter than this are skipped, frames later than this
    /// are dropped.
    pub min_exec_time: Duration,
    /// Use audio as the master clock when both audio and video are presented.
    pub prefer_audio_master: bool,
    /// Streams the host wants decoded and presented.
    pub display_media_types: MediaTypes,
    /// Per-format picture crop applied before presenting.
    pub plane_crop: HashMap<PixelFormat, PlaneCrop>,
}

impl Default for EngineConfig {
    /// Defaults tuned for local files with a few seconds of decode headroom.
    fn default() -> Self {
        Self {
            packet_queue_capacity: 256,
            video_frame_queue_capacity: 32,
            audio_frame_queue_capacity: 64,
            subtitle_frame_queue_capacity: 16,
            buffer_empty_size: 1,
            play_resume_size: 20,
            min_exec_time: Duration::from_millis(10),
            prefer_audio_master: true,
            display_media_types: MediaTypes::ALL,
            plane_crop: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Frame queue capacity for `media_type`, never below the resume threshold so the
    /// resume observer can fire.
    pub fn frame_queue_capacity(&self, media_type: MediaType) -> usize {
        let configured = match media_type {
            MediaType::Video => self.video_frame_queue_capacity,
            MediaType::Audio => self.audio_frame_queue_capacity,
            MediaType::Subtitle => self.subtitle_frame_queue_capacity,
        };
        match media_type {
            MediaType::Subtitle => configured.max(1),
            _ => configured.max(self.play_resume_size).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_queue_capacity_respects_resume_threshold() {
        let cfg = EngineConfig {
            video_frame_queue_capacity: 4,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.frame_queue_capacity(MediaType::Video), 20);
        assert_eq!(cfg.frame_queue_capacity(MediaType::Audio), 64);
        assert_eq!(cfg.frame_queue_capacity(MediaType::Subtitle), 16);
    }

    #[test]
    fn media_types_intersect() {
        let present = MediaTypes {
            video: false,
            audio: true,
            subtitle: true,
        };
        let desired = MediaTypes {
            video: true,
            audio: true,
            subtitle: false,
        };
        let real = desired.intersect(present);
        assert!(real.audio);
        assert!(!real.video);
        assert!(!real.subtitle);
        assert!(real.contains(MediaType::Audio));
    }
}
