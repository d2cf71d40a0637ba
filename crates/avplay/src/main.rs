//! avplay: play or probe a media file through the playback engine.
//!
//! ## Commands
//! - `play <path>`: decode, convert to the output device format and play, with
//!   interactive controls on stdin (`p`, `s <secs>`, `f <secs>`, `b <secs>`, `i`, `q`).
//! - `probe <path>`: print streams and duration.
//!
//! Session events are printed to stdout (plain text or JSON lines with `--json`); logs
//! go to stderr and follow `RUST_LOG`.

use anyhow::Result;
use clap::{CommandFactory, Parser};

use avplay::cli::{Args, Command};
use avplay::config::PlayConfig;
use avplay::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    runtime::init_tracing();

    if args.list_devices {
        return runtime::list_devices();
    }

    match &args.cmd {
        Some(Command::Play {
            path,
            start,
            json,
            no_video,
            no_audio,
        }) => {
            let config = PlayConfig::new(&args, path.clone(), *start, *json, *no_video, *no_audio);
            runtime::run_play(config)
        }
        Some(Command::Probe { path }) => runtime::run_probe(path),
        None => {
            Args::command().print_help()?;
            Ok(())
        }
    }
}
