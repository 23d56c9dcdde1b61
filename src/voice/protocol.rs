//! Gemini Live wire format.
//!
//! Only the fields the voice bridge reads or writes are modelled:
//!
//! 1. **Setup**: first client frame: model, response modality, voice,
//!    system instruction
//! 2. **Realtime input**: one message per capture frame, base64 PCM16LE
//! 3. **Server messages**: `setupComplete`, `serverContent` (audio parts,
//!    `interrupted`, `turnComplete`), `goAway`, `error`
//!
//! The service sends JSON in both Text and Binary WebSocket frames.

use serde::{Deserialize, Serialize};

use super::error::VoiceResult;

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio dialog model used for tutor calls.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt synthetic voice for the tutor.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Capture rate sent to the service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate of the PCM the service sends back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame.
pub const FRAME_SIZE: usize = 4096;

/// MIME tag for raw PCM16LE at `rate`.
pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={rate}")
}

// ── Setup message (JSON sent as first frame) ───────────────────────

/// What the bridge asks for when it opens a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Build the setup frame for a tutor call.
pub fn build_setup_message(setup: &SessionSetup) -> SetupMessage {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: (!setup.system_instruction.is_empty()).then(|| Content {
                parts: vec![Part {
                    text: Some(setup.system_instruction.clone()),
                    inline_data: None,
                }],
            }),
        },
    }
}

// ── Realtime input ─────────────────────────────────────────────────

/// Base64 payload plus its MIME tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// One captured frame, as handed to a session: `{ media: { data, mimeType } }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub media: Blob,
}

impl RealtimeInput {
    /// Wrap already-encoded PCM16LE base64 captured at `rate`.
    pub fn pcm(data: String, rate: u32) -> Self {
        Self {
            media: Blob {
                data,
                mime_type: pcm_mime(rate),
            },
        }
    }

    /// Wire form: `{"realtimeInput": {"mediaChunks": [{"mimeType": ..., "data": ...}]}}`.
    ///
    /// The SDKs still put `mediaChunks` on the wire; the newer `audio` field
    /// is not reliably processed by the server.
    pub fn into_wire(self) -> RealtimeInputMessage {
        RealtimeInputMessage {
            realtime_input: WireRealtimeInput {
                media_chunks: vec![self.media],
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: WireRealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ── Server messages ────────────────────────────────────────────────

/// A message from the service. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub error: Option<ServerErrorBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl LiveServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Base64 audio from `serverContent.modelTurn.parts[0].inlineData.data`.
    pub fn audio_data(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
            .map(|d| d.data.as_str())
    }

    /// First text part of the model turn, if any.
    pub fn text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.text.as_deref())
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.turn_complete)
            .unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .map(|e| e.message.as_deref().unwrap_or("Unknown server error"))
    }

    /// Message carrying a single audio part; used by tests and replay tools.
    pub fn with_audio(data: impl Into<String>) -> Self {
        Self {
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(InlineData {
                            data: data.into(),
                            mime_type: Some(pcm_mime(OUTPUT_SAMPLE_RATE)),
                        }),
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Message carrying only `serverContent.interrupted = true`.
    pub fn interrupted() -> Self {
        Self {
            server_content: Some(ServerContent {
                interrupted: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Parse one JSON frame from the service.
pub fn parse_server_message(json_text: &str) -> VoiceResult<LiveServerMessage> {
    Ok(serde_json::from_str(json_text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: "You are LearnBro.".to_string(),
        }
    }

    #[test]
    fn setup_message_serializes_audio_modality_and_voice() {
        let json = serde_json::to_string(&build_setup_message(&setup())).unwrap();
        assert!(json.contains("\"setup\""));
        assert!(json.contains("\"model\":\"models/gemini-2.5-flash-native-audio"));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"voiceName\":\"Zephyr\""));
        assert!(json.contains("\"systemInstruction\":{\"parts\":[{\"text\":\"You are LearnBro.\"}]}"));
    }

    #[test]
    fn setup_message_keeps_prefixed_model_and_skips_empty_instruction() {
        let mut s = setup();
        s.model = "models/custom".to_string();
        s.system_instruction.clear();
        let msg = build_setup_message(&s);
        assert_eq!(msg.setup.model, "models/custom");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("systemInstruction"));
    }

    #[test]
    fn realtime_input_wire_format() {
        let input = RealtimeInput::pcm("AAEC".to_string(), INPUT_SAMPLE_RATE);
        assert_eq!(input.media.mime_type, "audio/pcm;rate=16000");
        let logical = serde_json::to_value(&input).unwrap();
        assert_eq!(logical["media"]["mimeType"], "audio/pcm;rate=16000");

        let json = serde_json::to_value(input.into_wire()).unwrap();
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["data"], "AAEC");
        assert_eq!(
            json["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
    }

    #[test]
    fn parse_setup_complete() {
        let msg = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(!msg.is_interrupted());
        assert!(msg.audio_data().is_none());
    }

    #[test]
    fn parse_audio_from_first_part() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBBB"}}
        ]}}}"#;
        let msg = parse_server_message(json).unwrap();
        assert_eq!(msg.audio_data(), Some("AAAA"));
    }

    #[test]
    fn parse_text_only_turn_has_no_audio() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [{"text": "Hello"}]}}}"#;
        let msg = parse_server_message(json).unwrap();
        assert_eq!(msg.text(), Some("Hello"));
        assert!(msg.audio_data().is_none());
    }

    #[test]
    fn parse_interrupted_and_turn_complete() {
        let msg =
            parse_server_message(r#"{"serverContent": {"interrupted": true, "turnComplete": true}}"#)
                .unwrap();
        assert!(msg.is_interrupted());
        assert!(msg.is_turn_complete());
    }

    #[test]
    fn parse_error_and_go_away() {
        let msg = parse_server_message(r#"{"error": {"code": 429, "message": "Rate limit exceeded"}}"#)
            .unwrap();
        assert_eq!(msg.error_message(), Some("Rate limit exceeded"));

        let msg = parse_server_message(r#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert_eq!(msg.go_away.unwrap().time_left.as_deref(), Some("5s"));
    }

    #[test]
    fn parse_ignores_unknown_fields() {
        let msg = parse_server_message(r#"{"usageMetadata": {"totalTokenCount": 12}}"#).unwrap();
        assert_eq!(msg, LiveServerMessage::default());
    }

    #[test]
    fn parse_invalid_json() {
        assert!(parse_server_message("not json at all").is_err());
    }

    #[test]
    fn constructors_round_trip_through_accessors() {
        assert_eq!(LiveServerMessage::with_audio("QUJD").audio_data(), Some("QUJD"));
        assert!(LiveServerMessage::interrupted().is_interrupted());
    }
}
