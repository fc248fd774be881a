//! JSON control messages exchanged with the realtime backend.
//!
//! Every frame is a JSON object with a `type` tag.  Audio travels inside the
//! JSON as base64 PCM16 (24 kHz mono).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BackendConfig, TurnDetection};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A single inbound frame could not be understood.  Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame has no `type` tag")]
    MissingType,

    #[error("`{tag}` frame has an unexpected shape: {reason}")]
    Shape { tag: String, reason: String },

    #[error("audio payload is not valid base64: {0}")]
    Base64(String),
}

/// An error reported by the backend in an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PeerError {
    pub message: String,
    pub code: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Base64-encode a wire PCM chunk into an append frame.
    pub fn audio(pcm: &[u8]) -> Self {
        Self::InputAudioAppend {
            audio: BASE64.encode(pcm),
        }
    }

    /// A user text message for the conversation.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                kind: "message".into(),
                role: "user".into(),
                content: vec![ContentPart {
                    kind: "input_text".into(),
                    text: text.into(),
                }],
            },
        }
    }

    /// Wire tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioCommit => "input_audio_buffer.commit",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::InputAudioAppend { .. })
    }
}

/// Body of `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: Option<TranscriptionSettings>,
    /// `null` disables server-side turn detection.
    pub turn_detection: Option<TurnDetectionSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetectionSettings {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Build the one `session.update` sent after `session.created`.  `context`
/// is appended to the configured instructions.
pub fn session_update(backend: &BackendConfig, context: Option<&str>) -> ClientEvent {
    let instructions = match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(ctx) => format!("{}\n\nContext for this conversation:\n{ctx}", backend.instructions),
        None => backend.instructions.clone(),
    };
    let turn_detection = match backend.turn_detection {
        TurnDetection::ServerVad => Some(TurnDetectionSettings {
            kind: "server_vad".into(),
        }),
        TurnDetection::Manual => None,
    };

    ClientEvent::SessionUpdate {
        session: SessionSettings {
            modalities: vec!["audio".into(), "text".into()],
            instructions,
            voice: backend.voice.clone(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            input_audio_transcription: backend
                .transcription_model
                .clone()
                .map(|model| TranscriptionSettings { model }),
            turn_detection,
        },
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.created")]
    ResponseCreated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "input_audio_buffer.committed")]
    BufferCommitted,

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Vec<RateLimit>,
    },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimit {
    pub name: String,
    #[serde(default)]
    pub remaining: Option<f64>,
    #[serde(default)]
    pub reset_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl From<ErrorBody> for PeerError {
    fn from(body: ErrorBody) -> Self {
        let message = if body.message.is_empty() {
            "backend reported an error".to_string()
        } else {
            body.message
        };
        Self {
            message,
            code: body.code,
        }
    }
}

/// Parse one inbound text frame.  Returns the event and its wire tag.
pub fn parse_server_event(text: &str) -> Result<(ServerEvent, String), ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    let event = serde_json::from_value(value).map_err(|e| ProtocolError::Shape {
        tag: tag.clone(),
        reason: e.to_string(),
    })?;
    Ok((event, tag))
}

/// Decode the base64 PCM carried by an audio delta.
pub fn decode_audio(delta: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(delta)
        .map_err(|e| ProtocolError::Base64(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn to_value(event: &ClientEvent) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn unit_client_events_carry_only_type() {
        assert_eq!(
            to_value(&ClientEvent::InputAudioCommit),
            json!({"type": "input_audio_buffer.commit"})
        );
        assert_eq!(
            to_value(&ClientEvent::ResponseCreate),
            json!({"type": "response.create"})
        );
    }

    #[test]
    fn audio_append_is_base64() {
        let v = to_value(&ClientEvent::audio(&[0x00, 0x01, 0xFF]));
        assert_eq!(v["type"], "input_audio_buffer.append");
        assert_eq!(v["audio"], "AAH/");
    }

    #[test]
    fn user_text_item_shape() {
        let v = to_value(&ClientEvent::user_text("hello"));
        assert_eq!(
            v,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_text", "text": "hello"}]
                }
            })
        );
    }

    #[test]
    fn session_update_includes_context_and_vad() {
        let backend = BackendConfig::default();
        let v = to_value(&session_update(&backend, Some("slept badly")));
        assert_eq!(v["type"], "session.update");
        let session = &v["session"];
        assert!(session["instructions"]
            .as_str()
            .unwrap()
            .ends_with("slept badly"));
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn manual_turn_detection_sends_null() {
        let mut backend = BackendConfig::default();
        backend.turn_detection = TurnDetection::Manual;
        let v = to_value(&session_update(&backend, Some("   ")));
        assert!(v["session"]["turn_detection"].is_null());
        assert_eq!(v["session"]["instructions"], backend.instructions.as_str());
    }

    #[test]
    fn parses_lifecycle_frames_with_extra_fields() {
        let (event, tag) =
            parse_server_event(r#"{"type":"session.updated","event_id":"e1","session":{}}"#)
                .unwrap();
        assert_eq!(event, ServerEvent::SessionUpdated);
        assert_eq!(tag, "session.updated");

        let (event, _) =
            parse_server_event(r#"{"type":"session.created","session":{"id":"sess_1"}}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::SessionCreated {
                session: SessionInfo {
                    id: Some("sess_1".into())
                }
            }
        );
    }

    #[test]
    fn parses_audio_delta() {
        let (event, _) =
            parse_server_event(r#"{"type":"response.audio.delta","delta":"AAH/"}"#).unwrap();
        let ServerEvent::AudioDelta { delta } = event else {
            panic!("wrong variant");
        };
        assert_eq!(decode_audio(&delta).unwrap(), vec![0x00, 0x01, 0xFF]);
    }

    #[test]
    fn parses_error_frame() {
        let (event, _) = parse_server_event(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad","message":"nope"}}"#,
        )
        .unwrap();
        let ServerEvent::Error { error } = event else {
            panic!("wrong variant");
        };
        let peer = PeerError::from(error);
        assert_eq!(peer.message, "nope");
        assert_eq!(peer.code.as_deref(), Some("bad"));
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        let (event, tag) = parse_server_event(r#"{"type":"response.text.delta","delta":"x"}"#)
            .unwrap();
        assert_eq!(event, ServerEvent::Unknown);
        assert_eq!(tag, "response.text.delta");
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(
            parse_server_event("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert_eq!(
            parse_server_event(r#"{"typ":"unknown_x"}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert!(matches!(
            parse_server_event(r#"{"type":"response.audio.delta"}"#),
            Err(ProtocolError::Shape { .. })
        ));
        assert!(matches!(decode_audio("***"), Err(ProtocolError::Base64(_))));
    }

    #[test]
    fn rate_limits_parse() {
        let (event, _) = parse_server_event(
            r#"{"type":"rate_limits.updated","rate_limits":[{"name":"tokens","limit":100,"remaining":40,"reset_seconds":1.5}]}"#,
        )
        .unwrap();
        let ServerEvent::RateLimitsUpdated { rate_limits } = event else {
            panic!("wrong variant");
        };
        assert_eq!(rate_limits[0].name, "tokens");
        assert_eq!(rate_limits[0].remaining, Some(40.0));
    }
}
