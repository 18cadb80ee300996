//! The wire `Event` — the single object that crosses NDJSON and WebSocket.
//!
//! `Event` always carries `protocolVersion`, `sessionId`, `seq`, and a
//! `{type, payload}` body. `EventBody`'s `tag = "type", content = "payload"`
//! attribute reproduces that shape without hand-written (de)serialization.

use serde::{Deserialize, Serialize};

use crate::ids::{CallId, SessionId};

/// Stamped on every event. A receiver whose known version does not match
/// should close the connection with `UNSUPPORTED_PROTOCOL`.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn new(session_id: SessionId, seq: u64, body: EventBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            seq,
            body,
        }
    }

    /// The `type` discriminant, for filter matching and logging.
    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    SessionInit {
        #[serde(rename = "cancelUrl")]
        cancel_url: String,
        #[serde(rename = "expiresAt")]
        expires_at: chrono::DateTime<chrono::Utc>,
        encryption: EncryptionInfo,
    },
    ToolCall {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: serde_json::Value,
    },
    ToolResultApplied {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    Heartbeat {},
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    Final {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FinalError>,
        stats: FinalStats,
    },
    Encrypted {
        kid: String,
        #[serde(rename = "nonceB64")]
        nonce_b64: String,
        #[serde(rename = "ciphertextB64")]
        ciphertext_b64: String,
    },
}

impl EventBody {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventBody::SessionInit { .. } => "session_init",
            EventBody::ToolCall { .. } => "tool_call",
            EventBody::ToolResultApplied { .. } => "tool_result_applied",
            EventBody::Heartbeat {} => "heartbeat",
            EventBody::Error { .. } => "error",
            EventBody::Final { .. } => "final",
            EventBody::Encrypted { .. } => "encrypted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct FinalStats {
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "toolCallCount")]
    pub tool_call_count: u32,
    #[serde(rename = "stdoutBytes")]
    pub stdout_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_init_round_trips_through_json() {
        let event = Event::new(
            SessionId::generate(),
            1,
            EventBody::SessionInit {
                cancel_url: "/sessions/s_x".into(),
                expires_at: chrono::Utc::now(),
                encryption: EncryptionInfo { enabled: false },
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session_init""#));
        assert!(json.contains(r#""payload":{"#));
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.event_type(), "session_init");
    }

    #[test]
    fn final_omits_absent_result_and_error() {
        let event = Event::new(
            SessionId::generate(),
            2,
            EventBody::Final {
                ok: true,
                result: Some(serde_json::json!(3)),
                error: None,
                stats: FinalStats {
                    duration_ms: 4,
                    tool_call_count: 0,
                    stdout_bytes: 0,
                },
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"result\":3"));
    }

    #[test]
    fn heartbeat_has_empty_payload() {
        let event = Event::new(SessionId::generate(), 3, EventBody::Heartbeat {});
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""payload":{}"#));
    }
}
