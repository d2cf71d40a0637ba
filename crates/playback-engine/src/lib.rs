//! Threaded media playback engine.
//!
//! A [`PlaybackSession`] reads compressed packets on one thread, decodes every stream
//! on its own thread through bounded queues, paces video against a shared
//! [`clock::SyncClock`] and answers the audio device's pull callback through
//! [`AudioPull`].
//!
//! Backends: [`source`] (Symphonia demux/decode), [`resample`] (Rubato), and
//! [`device`] / [`playback`] (CPAL output).

pub mod clock;
pub mod config;
pub mod decoder;
pub mod device;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod frame;
pub mod gate;
pub mod media;
pub mod playback;
pub mod queue;
pub mod resample;
pub mod session;
pub mod source;
pub mod time_filter;

#[cfg(test)]
mod test_support;

pub use config::{EngineConfig, MediaTypes, PlaneCrop};
pub use diagnostics::{Diagnostics, NullDiagnostics, TracingDiagnostics};
pub use display::AudioPull;
pub use error::{CodecError, EngineError, Result};
pub use frame::{AudioFormat, MediaType, PixelFormat, SampleFormat};
pub use media::{
    CodecProvider, Demuxer, SessionObserver, SourceInfo, SourceOpener, VideoPicture,
    VideoRenderer,
};
pub use session::{PlaybackSession, SessionBuilder};
pub use source::{SymphoniaCodecs, SymphoniaOpener};

pub use playback_types::{PlaybackEndReason, SessionEvent, SessionState, SessionStatus};
