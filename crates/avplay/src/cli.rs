use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "avplay", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, global = true, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Compressed packets buffered per stream
    #[arg(long, global = true, default_value_t = 256)]
    pub packet_queue: usize,

    /// Decoded audio frames buffered ahead of the device
    #[arg(long, global = true, default_value_t = 64)]
    pub audio_frames: usize,

    /// Decoded video frames buffered ahead of the display
    #[arg(long, global = true, default_value_t = 32)]
    pub video_frames: usize,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file with interactive controls on stdin
    Play {
        /// Path to the media file
        path: PathBuf,

        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// Print session events as JSON lines
        #[arg(long)]
        json: bool,

        /// Skip video streams
        #[arg(long)]
        no_video: bool,

        /// Skip audio streams
        #[arg(long)]
        no_audio: bool,
    },

    /// Print the streams and duration of a file
    Probe {
        /// Path to the media file
        path: PathBuf,
    },
}
