use serde::{Deserialize, Serialize};

/// Reason why a playback session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Every buffered frame of the source was consumed after end of file.
    Eof,
    /// Decoder, source, or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by the host.
    Stopped,
}

/// Lifecycle state of a playback session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing opened (initial state, and again after teardown).
    #[default]
    Idle,
    /// Source opened and decoders prepared; threads not running yet.
    Prepared,
    Playing,
    Paused,
    /// A seek is in flight; ends once enough post-seek data is buffered.
    Seeking,
    /// Stop requested; threads are winding down.
    Stopping,
    /// Resources released; about to return to `Idle`.
    Stopped,
}

/// Notification emitted by a session to its host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Source opened and every decoder prepared.
    ConnectCompleted { duration_secs: f64 },
    /// Buffering stall entered (`true`) or recovered (`false`).
    BufferingChanged { buffering: bool },
    /// A seek finished. `ok == false` means the source refused to reposition and
    /// playback continues from the pre-seek position.
    SeekCompleted { target_secs: f64, ok: bool },
    /// Playback ended.
    Finished { reason: PlaybackEndReason },
}

/// Point-in-time view of a session for status displays.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Current media position in seconds.
    pub position_secs: f64,
    /// Total media duration in seconds (0 when unknown).
    pub duration_secs: f64,
    /// `true` while the display is held because the check buffer ran dry.
    pub buffering: bool,
    pub seeking: bool,
    /// Pause requested by the host (independent of buffering stalls).
    pub paused: bool,
    /// `true` when audio drives the reference clock.
    pub audio_master: bool,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_subtitle: bool,
    /// Decoded frames waiting in the video frame queue.
    pub video_frames_buffered: Option<usize>,
    /// Decoded frames waiting in the audio frame queue.
    pub audio_frames_buffered: Option<usize>,
    /// End reason once the session reached a terminal state.
    pub end_reason: Option<PlaybackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_serializes_snake_case() {
        let json = serde_json::to_string(&PlaybackEndReason::Eof).unwrap();
        assert_eq!(json, "\"eof\"");
    }

    #[test]
    fn event_is_internally_tagged() {
        let event = SessionEvent::BufferingChanged { buffering: true };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"buffering_changed","buffering":true}"#);
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_defaults_to_idle() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Idle);
        assert!(!status.buffering);
        assert!(status.end_reason.is_none());
    }
}
