use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::voice::bridge::BridgeConfig;
use crate::voice::gemini_live::{GeminiLiveConnector, API_KEY_ENV_VARS};
use crate::voice::language::{VoiceLanguage, DEFAULT_PERSONA};
use crate::voice::protocol::{
    DEFAULT_MODEL, DEFAULT_VOICE, FRAME_SIZE, GEMINI_LIVE_WS_URL, INPUT_SAMPLE_RATE,
    OUTPUT_SAMPLE_RATE,
};
use crate::voice::session::ErrorPolicy;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level LearnBro Live configuration, loaded from `config.toml`.
///
/// Every field has a default, so a missing or empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from (computed, not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub tutor: TutorConfig,

    #[serde(default)]
    pub errors: ErrorPolicy,
}

// ── Live session ──────────────────────────────────────────────────

/// Remote session settings.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | endpoint | Gemini Live WSS URL | BidiGenerateContent endpoint |
/// | model | `gemini-2.5-flash-native-audio-preview-09-2025` | `models/` is prefixed if missing |
/// | voice | `Zephyr` | Prebuilt voice name |
/// | api_key | none | Falls back to `GEMINI_API_KEY`, then `API_KEY` |
/// | setup_timeout_secs | 15 | Bound on connect + `setupComplete` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

fn default_endpoint() -> String {
    GEMINI_LIVE_WS_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_setup_timeout_secs() -> u64 {
    15
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            voice: default_voice(),
            api_key: None,
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate frames are sent at (the service expects 16 kHz).
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// Rate of received fragments (the service sends 24 kHz).
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Samples per captured frame.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_output_gain")]
    pub output_gain: f32,
    /// Substring match on the device name; unset means the system default.
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
}

fn default_input_sample_rate() -> u32 {
    INPUT_SAMPLE_RATE
}

fn default_output_sample_rate() -> u32 {
    OUTPUT_SAMPLE_RATE
}

fn default_frame_size() -> usize {
    FRAME_SIZE
}

fn default_output_gain() -> f32 {
    1.0
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            frame_size: default_frame_size(),
            output_gain: default_output_gain(),
            input_device: None,
            output_device: None,
        }
    }
}

// ── Tutor ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorConfig {
    /// Base persona; the language and voice-mode directives are appended.
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default)]
    pub language: VoiceLanguage,
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            language: VoiceLanguage::default(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// `<config dir>/learnbro-live/config.toml` for the current user.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "learnbro-live")
            .context("Could not determine a config directory for this user")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from [`Config::default_path`]. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.config_path = path;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            anyhow::bail!("audio sample rates must be non-zero");
        }
        if self.audio.frame_size == 0 {
            anyhow::bail!("audio.frame_size must be non-zero");
        }
        if !self.audio.output_gain.is_finite() || self.audio.output_gain < 0.0 {
            anyhow::bail!("audio.output_gain must be a non-negative number");
        }
        if self.live.setup_timeout_secs == 0 {
            anyhow::bail!("live.setup_timeout_secs must be non-zero");
        }
        Ok(())
    }

    /// Where the API key will come from, without revealing it.
    pub fn api_key_source(&self) -> Option<&'static str> {
        if self
            .live
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
        {
            return Some("config");
        }
        API_KEY_ENV_VARS
            .iter()
            .copied()
            .find(|var| std::env::var(var).is_ok_and(|k| !k.trim().is_empty()))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            model: self.live.model.clone(),
            voice_name: self.live.voice.clone(),
            persona: self.tutor.persona.clone(),
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            frame_size: self.audio.frame_size,
            output_gain: self.audio.output_gain,
            input_device: self.audio.input_device.clone(),
            output_device: self.audio.output_device.clone(),
            error_policy: self.errors.clone(),
        }
    }

    pub fn connector(&self) -> GeminiLiveConnector {
        GeminiLiveConnector::new(
            self.live.endpoint.clone(),
            self.live.api_key.clone(),
            Duration::from_secs(self.live.setup_timeout_secs),
        )
    }
}
