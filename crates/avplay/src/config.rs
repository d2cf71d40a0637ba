//! Resolved settings for the `play` and `probe` commands.

use std::path::PathBuf;

use playback_engine::{EngineConfig, MediaTypes};

use crate::cli::Args;

/// Engine and device settings shared by every command.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    pub device: Option<String>,
    pub chunk_frames: usize,
    pub engine: EngineConfig,
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub start_secs: f64,
    pub json: bool,
    pub output: OutputConfig,
}

impl OutputConfig {
    pub fn from_args(args: &Args) -> Self {
        let engine = EngineConfig {
            packet_queue_capacity: args.packet_queue.max(1),
            audio_frame_queue_capacity: args.audio_frames,
            video_frame_queue_capacity: args.video_frames,
            ..EngineConfig::default()
        };
        Self {
            device: normalize_device_name(args.device.clone()),
            chunk_frames: args.chunk_frames.max(1),
            engine,
        }
    }
}

impl PlayConfig {
    pub fn new(args: &Args, path: PathBuf, start_secs: f64, json: bool, no_video: bool, no_audio: bool) -> Self {
        let mut output = OutputConfig::from_args(args);
        output.engine.display_media_types = MediaTypes {
            video: !no_video,
            audio: !no_audio,
            subtitle: true,
        };
        Self {
            path,
            start_secs: if start_secs.is_finite() { start_secs.max(0.0) } else { 0.0 },
            json,
            output,
        }
    }

    pub fn media_types(&self) -> MediaTypes {
        self.output.engine.display_media_types
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
