//! LearnBro Live: realtime voice calls with the LearnBro tutor.
//!
//! The crate streams microphone audio to the Gemini Live API and plays the
//! tutor's spoken replies back without gaps, cutting playback immediately
//! when the service reports that the user has barged in.
//!
//! ## Layout
//! - [`voice`]: the voice bridge and everything it depends on (PCM codec,
//!   wire protocol, playback scheduling, device and session seams)
//! - [`config`]: TOML + environment configuration

pub mod config;
pub mod voice;

pub use config::Config;
pub use voice::{
    BridgeCallbacks, BridgeConfig, BridgeStats, ConnectionStatus, VoiceBridge, VoiceError,
    VoiceLanguage, VoiceResult,
};
