//! Realtime event types exchanged over the duplex connection.
//!
//! All events are JSON objects discriminated by `type`. The relay forwards
//! them verbatim; these types are used by the call client, the relay's own
//! notices and tests.
//!
//! Client events (sent upstream):
//! - session.update
//! - input_audio_buffer.append / commit / clear
//! - response.create / response.cancel
//!
//! Server events (received from upstream, plus relay notices):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped / committed
//! - response.created / response.done / response.cancelled
//! - response.audio.delta, response.audio_transcript.delta, response.text.delta
//! - error
//! - upstream.open / upstream.error / upstream.close (relay notices)
//!
//! Upstreams differ in which optional fields they populate, so every field
//! that is not needed to act on an event defaults when absent.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::audio::PcmEncoding;
use crate::core::error::{CallError, CallResult};

/// Fresh client event id (`event_<uuid>`).
pub fn new_event_id() -> String {
    format!("event_{}", uuid::Uuid::new_v4().simple())
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration carried by `session.update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format (pcm16)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format (pcm16, pcm24)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupt_response: Option<bool>,
    },
    /// No server turn detection; the client commits the buffer itself
    #[serde(rename = "none")]
    None {},
}

impl TurnDetection {
    /// Server VAD with the upstream's defaults.
    pub fn server_vad() -> Self {
        TurnDetection::ServerVad {
            threshold: None,
            prefix_padding_ms: None,
            silence_duration_ms: None,
            create_response: Some(true),
            interrupt_response: Some(true),
        }
    }
}

/// Per-response overrides carried by `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
}

// =============================================================================
// Client Events
// =============================================================================

/// Events sent by the client towards the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        session: SessionConfig,
    },

    /// Append base64 PCM16 audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        audio: String,
    },

    /// Commit the input audio buffer as a user turn
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },

    /// Discard uncommitted input audio
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },

    /// Ask the model for a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    /// Cancel the in-progress response (barge-in)
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// Audio append event for raw PCM16 bytes, with a fresh event id.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            event_id: Some(new_event_id()),
            audio: BASE64_STANDARD.encode(data),
        }
    }

    pub fn commit() -> Self {
        ClientEvent::InputAudioBufferCommit {
            event_id: Some(new_event_id()),
        }
    }

    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate {
            event_id: Some(new_event_id()),
            response: None,
        }
    }

    pub fn response_cancel(response_id: Option<String>) -> Self {
        ClientEvent::ResponseCancel {
            event_id: Some(new_event_id()),
            response_id,
        }
    }

    pub fn session_update(session: SessionConfig) -> Self {
        ClientEvent::SessionUpdate {
            event_id: Some(new_event_id()),
            session,
        }
    }

    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit { .. } => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear { .. } => "input_audio_buffer.clear",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel { .. } => "response.cancel",
        }
    }

    /// Serialize to the JSON text carried on the wire.
    pub fn to_json(&self) -> CallResult<String> {
        serde_json::to_string(self).map_err(|e| CallError::ProtocolError(e.to_string()))
    }
}

// =============================================================================
// Server Events
// =============================================================================

/// Events received from the upstream, plus the relay's own notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error reported by the upstream
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ApiError,
    },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: serde_json::Value,
    },

    /// Server VAD detected the user speaking
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    /// Server VAD detected the user stopped speaking
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: String,
    },

    /// Transcript of the user's committed audio
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },

    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    /// Chunk of synthesized speech
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        /// Base64 audio payload
        delta: String,
        /// Sample-rate hint for this and later chunks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate_hz: Option<u32>,
        /// Explicit encoding declaration (pcm16, pcm24)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
    },

    /// Caption text for the synthesized speech
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        transcript: String,
    },

    /// Text-only response chunk
    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: String,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        text: String,
    },

    /// Relay connected to the upstream
    #[serde(rename = "upstream.open")]
    UpstreamOpen,

    /// Relay lost the upstream because of a transport error
    #[serde(rename = "upstream.error")]
    UpstreamError { message: String },

    /// Upstream closed the connection
    #[serde(rename = "upstream.close")]
    UpstreamClose {
        #[serde(default)]
        code: u16,
        #[serde(default)]
        reason: String,
    },

    /// Any event this client does not act on
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one JSON text message.
    pub fn parse(text: &str) -> CallResult<Self> {
        serde_json::from_str(text).map_err(|e| CallError::ProtocolError(e.to_string()))
    }

    /// Serialize to the JSON text carried on the wire.
    pub fn to_json(&self) -> CallResult<String> {
        serde_json::to_string(self).map_err(|e| CallError::ProtocolError(e.to_string()))
    }

    /// Decode the base64 payload of an audio delta.
    pub fn decode_audio_delta(delta: &str) -> CallResult<Vec<u8>> {
        BASE64_STANDARD
            .decode(delta)
            .map_err(|e| CallError::MalformedFrame(format!("invalid base64: {e}")))
    }

    /// Declared encoding of an audio delta's `format` field, if recognised.
    pub fn declared_encoding(format: Option<&str>) -> Option<PcmEncoding> {
        format.and_then(PcmEncoding::from_format)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Error payload of an `error` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Response identity and status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ResponseInfo {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_serialization() {
        let event = ClientEvent::InputAudioBufferCommit { event_id: None };
        let json = event.to_json().unwrap();
        assert_eq!(json, r#"{"type":"input_audio_buffer.commit"}"#);
    }

    #[test]
    fn test_audio_append_carries_event_id() {
        let data = vec![0u8, 1, 2, 3];
        match ClientEvent::audio_append(&data) {
            ClientEvent::InputAudioBufferAppend { event_id, audio } => {
                assert!(event_id.unwrap().starts_with("event_"));
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap(), data);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_session_update_serialization() {
        let event = ClientEvent::SessionUpdate {
            event_id: None,
            session: SessionConfig {
                modalities: Some(vec!["audio".to_string(), "text".to_string()]),
                voice: Some("Cherry".to_string()),
                input_audio_format: Some("pcm16".to_string()),
                turn_detection: Some(TurnDetection::server_vad()),
                ..Default::default()
            },
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "Cherry");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert!(json["session"].get("instructions").is_none());
    }

    #[test]
    fn test_audio_delta_with_rate_hint() {
        let json = r#"{"type":"response.audio.delta","response_id":"resp_1","delta":"AAAA","sample_rate_hz":24000,"format":"pcm24"}"#;
        match ServerEvent::parse(json).unwrap() {
            ServerEvent::AudioDelta {
                response_id,
                delta,
                sample_rate_hz,
                format,
                ..
            } => {
                assert_eq!(response_id, "resp_1");
                assert_eq!(ServerEvent::decode_audio_delta(&delta).unwrap(), vec![0, 0, 0]);
                assert_eq!(sample_rate_hz, Some(24_000));
                assert_eq!(
                    ServerEvent::declared_encoding(format.as_deref()),
                    Some(PcmEncoding::Pcm24)
                );
            }
            other => panic!("Wrong event type: {other:?}"),
        }
    }

    #[test]
    fn test_error_event_and_unknown_events() {
        let json = r#"{"type":"error","error":{"type":"invalid_request_error","message":"Test error"}}"#;
        match ServerEvent::parse(json).unwrap() {
            ServerEvent::Error { error } => assert_eq!(error.message, "Test error"),
            _ => panic!("Wrong event type"),
        }

        let unknown = ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#);
        assert_eq!(unknown.unwrap(), ServerEvent::Unknown);

        assert!(matches!(
            ServerEvent::parse("not json"),
            Err(CallError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_response_done_cancelled_status() {
        let json = r#"{"type":"response.done","response":{"id":"resp_9","status":"cancelled"}}"#;
        match ServerEvent::parse(json).unwrap() {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.id, "resp_9");
                assert!(response.is_cancelled());
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_relay_notices_round_trip_through_json() {
        let close = ServerEvent::UpstreamClose {
            code: 1011,
            reason: "upstream error".to_string(),
        };
        let json = close.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"upstream.close","code":1011,"reason":"upstream error"}"#
        );
        assert_eq!(
            ServerEvent::UpstreamOpen.to_json().unwrap(),
            r#"{"type":"upstream.open"}"#
        );
    }
}
