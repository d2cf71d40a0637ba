//! Human-readable and JSON rendering of session events, status and probe results.

use playback_engine::media::StreamInfo;
use playback_engine::{SessionEvent, SessionStatus, SourceInfo};

pub fn format_event(event: &SessionEvent, json: bool) -> String {
    if json {
        return serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
    }
    match event {
        SessionEvent::ConnectCompleted { duration_secs } => {
            format!("opened ({})", format_secs(*duration_secs))
        }
        SessionEvent::BufferingChanged { buffering: true } => "buffering...".to_string(),
        SessionEvent::BufferingChanged { buffering: false } => "buffering done".to_string(),
        SessionEvent::SeekCompleted { target_secs, ok: true } => {
            format!("seeked to {}", format_secs(*target_secs))
        }
        SessionEvent::SeekCompleted { target_secs, ok: false } => {
            format!("seek to {} failed", format_secs(*target_secs))
        }
        SessionEvent::Finished { reason } => format!("finished: {reason:?}").to_lowercase(),
    }
}

pub fn format_status(status: &SessionStatus, json: bool) -> String {
    if json {
        return serde_json::to_string(status).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
    }
    let mut line = format!(
        "{:?} {} / {}",
        status.state,
        format_secs(status.position_secs),
        format_secs(status.duration_secs)
    );
    if status.buffering {
        line.push_str(" [buffering]");
    }
    if status.seeking {
        line.push_str(" [seeking]");
    }
    if let Some(n) = status.audio_frames_buffered {
        line.push_str(&format!(" audio_q={n}"));
    }
    if let Some(n) = status.video_frames_buffered {
        line.push_str(&format!(" video_q={n}"));
    }
    line
}

/// One line per stream followed by the duration.
pub fn format_probe(info: &SourceInfo) -> String {
    let mut out = String::new();
    for stream in &info.streams {
        out.push_str(&format_stream(stream));
        out.push('\n');
    }
    out.push_str(&format!("duration: {}", format_secs(info.duration_secs)));
    out
}

fn format_stream(stream: &StreamInfo) -> String {
    let codec = stream.params.codec_name.as_deref().unwrap_or("unknown");
    let mut line = format!("#{} {} {codec}", stream.index, stream.media_type.label());
    if let Some(fmt) = stream.params.audio_format {
        line.push_str(&format!(" {} Hz, {} ch", fmt.sample_rate, fmt.channels));
    }
    if let (Some(w), Some(h)) = (stream.params.width, stream.params.height) {
        line.push_str(&format!(" {w}x{h}"));
    }
    line
}

/// `h:mm:ss.mmm`, or `m:ss.mmm` under an hour.
pub fn format_secs(secs: f64) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let s = (total_ms / 1000) % 60;
    let m = (total_ms / 60_000) % 60;
    let h = total_ms / 3_600_000;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}.{ms:03}")
    } else {
        format!("{m}:{s:02}.{ms:03}")
    }
}
