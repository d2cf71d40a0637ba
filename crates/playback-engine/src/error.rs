//! Error types surfaced by the engine.

use thiserror::Error;

use crate::frame::MediaType;

/// Failure reported by a codec collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The codec library has no decoder for the stream.
    #[error("no decoder available: {0}")]
    Unavailable(String),

    /// A decoder exists but refused to initialize.
    #[error("decoder failed to open: {0}")]
    OpenFailed(String),

    /// A single packet or frame could not be processed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors returned by [`crate::session::PlaybackSession`] operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The source has neither a decodable audio nor video stream.
    #[error("no playable stream")]
    NoPlayableStream,

    #[error("{media} stream {stream}: codec unavailable: {reason}")]
    CodecUnavailable {
        stream: usize,
        media: &'static str,
        reason: String,
    },

    #[error("{media} stream {stream}: codec open failed: {reason}")]
    CodecOpenFailed {
        stream: usize,
        media: &'static str,
        reason: String,
    },

    /// The demuxer could not open or probe the source.
    #[error("source open failed: {0:#}")]
    SourceOpen(anyhow::Error),

    /// Opening was cancelled through [`crate::session::PlaybackSession::cancel_open`].
    #[error("open cancelled")]
    Cancelled,

    /// Video is selected for display but the host supplied no renderer.
    #[error("video stream present but no renderer configured")]
    MissingRenderer,

    /// The operation is not valid in the current session state.
    #[error("{op} not allowed while {state:?}")]
    InvalidState {
        op: &'static str,
        state: playback_types::SessionState,
    },

    #[error("thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

impl EngineError {
    /// Map a prepare-time codec failure onto the engine taxonomy.
    pub(crate) fn from_codec(stream: usize, media: MediaType, err: CodecError) -> Self {
        match err {
            CodecError::Unavailable(reason) => EngineError::CodecUnavailable {
                stream,
                media: media.label(),
                reason,
            },
            CodecError::OpenFailed(reason) | CodecError::Decode(reason) => {
                EngineError::CodecOpenFailed {
                    stream,
                    media: media.label(),
                    reason,
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
