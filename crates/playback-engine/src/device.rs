//! Output device discovery and format negotiation.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing an output config the engine can fill, and describing it as an [`AudioFormat`]

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::frame::{AudioFormat, SampleFormat};

/// Pick the first output device whose name contains `needle` (case-insensitive), or
/// the host default device when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("no output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .is_ok_and(|n| matches_device_name(&n.name(), needle))
            })
            .ok_or_else(|| anyhow!("no output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

/// Choose an output config for a source playing at `target_rate`.
///
/// Prefers a rate equal to the source, then the highest rate at or below it, then the
/// lowest rate above it. Only sample formats the engine can produce are considered.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let Some(format_rank) = sample_format_rank(range.sample_format()) else {
            continue;
        };
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: target_rate.is_none_or(|t| rate <= t),
            rate,
            format_rank,
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.is_better_than(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("no supported output config in a usable sample format"))
}

/// Pick a stream buffer size, preferring larger values to reduce underruns.
///
/// Returns `None` when the device reports no range, so CPAL uses its default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// The engine format matching a device config, if the engine can produce it.
pub fn engine_format(config: &cpal::SupportedStreamConfig) -> Option<AudioFormat> {
    Some(AudioFormat {
        sample_rate: config.sample_rate(),
        channels: config.channels(),
        sample_format: engine_sample_format(config.sample_format())?,
    })
}

fn engine_sample_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        cpal::SampleFormat::I32 => Some(SampleFormat::I32),
        cpal::SampleFormat::I16 => Some(SampleFormat::I16),
        cpal::SampleFormat::U8 => Some(SampleFormat::U8),
        _ => None,
    }
}

/// Print available output devices to stdout (`--list-devices`).
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("no output devices")?;
    for (i, d) in devices.enumerate() {
        let name = d.description()?;
        match d.default_output_config() {
            Ok(cfg) => println!(
                "#{i}: {name} ({} Hz, {} ch, {:?})",
                cfg.sample_rate(),
                cfg.channels(),
                cfg.sample_format()
            ),
            Err(_) => println!("#{i}: {name}"),
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, best: &Candidate) -> bool {
        if self.below != best.below {
            self.below
        } else if self.rate != best.rate {
            self.rate > best.rate
        } else {
            self.format_rank < best.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> Option<u8> {
    match format {
        cpal::SampleFormat::F32 => Some(0),
        cpal::SampleFormat::I32 => Some(1),
        cpal::SampleFormat::I16 => Some(2),
        cpal::SampleFormat::U8 => Some(3),
        _ => None,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
