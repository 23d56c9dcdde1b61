//! Realtime voice calls with the LearnBro tutor.
//!
//! ## Design
//! - A single call driver per call owns the session, both audio devices and
//!   the playback schedule, and applies queued events in order
//! - Trait seams for the remote session (`LiveConnector`) and sound card
//!   (`AudioBackend`), so the driver runs unchanged against fakes
//! - Gemini Live WebSocket client with JSON-in-Binary frame handling
//! - Gapless, interruption-aware playback on the output device clock
//! - PCM16LE/base64 codec at the service's fixed 16 kHz in / 24 kHz out

pub mod bridge;
pub mod cpal_backend;
pub mod device;
pub mod error;
pub mod events;
pub mod gemini_live;
pub mod language;
pub mod pcm;
pub mod protocol;
pub mod schedule;
pub mod session;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeCallbacks, BridgeConfig, BridgeStats, VoiceBridge};
pub use cpal_backend::CpalBackend;
pub use error::{VoiceError, VoiceResult};
pub use gemini_live::GeminiLiveConnector;
pub use language::VoiceLanguage;
pub use status::ConnectionStatus;
