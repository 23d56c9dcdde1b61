//! Spoken-language selection and system-instruction assembly.
//!
//! The language is fixed for the lifetime of a session: it is baked into
//! the system instruction sent in the setup frame, so switching requires a
//! full reconnect.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Base tutor persona used when the config does not supply one.
pub const DEFAULT_PERSONA: &str = "You are LearnBro, an AI tutor who explains any topic like a \
student's best friend: simple words, real-life examples, short sentences, step-by-step logic \
and an encouraging tone. If you are unsure of something, say so instead of guessing.";

/// Languages the tutor can speak on a voice call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceLanguage {
    #[default]
    English,
    Hindi,
    Bengali,
}

impl VoiceLanguage {
    pub fn all() -> &'static [VoiceLanguage] {
        &[Self::English, Self::Hindi, Self::Bengali]
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::English => "English",
            Self::Hindi => "Hindi",
            Self::Bengali => "Bengali",
        }
    }

    /// Directive appended to the system instruction for this language.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::English => "You must speak in English.",
            Self::Hindi => {
                "You must speak in Hindi. You can use Hinglish for technical terms if needed, \
                 but keep the conversation natural and in Hindi."
            }
            Self::Bengali => {
                "You must speak in Bengali. Keep the tone natural, friendly, and use Bengali \
                 for all responses."
            }
        }
    }
}

impl fmt::Display for VoiceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for VoiceLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "english" | "en" => Ok(Self::English),
            "hindi" | "hi" => Ok(Self::Hindi),
            "bengali" | "bangla" | "bn" => Ok(Self::Bengali),
            other => Err(format!(
                "unsupported voice language '{other}' (expected english, hindi or bengali)"
            )),
        }
    }
}

/// Persona + language directive + spoken-format directive.
pub fn build_system_instruction(persona: &str, language: VoiceLanguage) -> String {
    let persona = persona.trim();
    let persona = if persona.is_empty() {
        DEFAULT_PERSONA
    } else {
        persona
    };
    format!(
        "{persona}\n\n\
         [CRITICAL INSTRUCTION: VOICE MODE ACTIVE]\n\
         1. {}\n\
         2. Keep responses concise, spoken-word friendly (no markdown, no bullets).\n\
         3. Be energetic and act like a real tutor on a call.",
        language.instruction()
    )
}
