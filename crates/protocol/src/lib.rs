//! Wire messages for the runtime WebSocket endpoint (§4.9).
//!
//! Outbound traffic on that socket is just `sbx_domain::event::Event`
//! serialized as JSON text frames — no extra envelope needed, since a
//! runtime connection multiplexes every session's events already shaped by
//! the broker. Inbound traffic is what a runtime sends back: tool results,
//! and (for runtimes that host their own sandbox) lifecycle signals.

use serde::{Deserialize, Serialize};

use sbx_domain::ids::{CallId, SessionId};

/// A message a runtime connection sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeInbound {
    /// The answer to a `tool_call` event the broker emitted earlier.
    ToolResult {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "callId")]
        call_id: CallId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The runtime observed the sandboxed code terminate on its own.
    Completed {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A message the broker sends down a runtime connection, outside of the
/// plain `Event` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeControl {
    /// Assigns a session's code to this connection. Sent once per session,
    /// as soon as a runtime-mode session starts (§4.3 Runtime mode, step 1).
    Execute {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        code: String,
    },
    /// Tells the runtime to abandon a session's execution. `Event` itself
    /// has no representation for "stop running", so this travels alongside
    /// the stream instead.
    Cancel {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_round_trips_without_optional_fields() {
        let msg = RuntimeInbound::ToolResult {
            session_id: SessionId::generate(),
            call_id: CallId::generate(),
            ok: true,
            value: Some(serde_json::json!({"bytes": 12})),
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"error\""));
        let parsed: RuntimeInbound = serde_json::from_str(&json).unwrap();
        match parsed {
            RuntimeInbound::ToolResult { ok, error, .. } => {
                assert!(ok);
                assert!(error.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cancel_control_message_tags_as_cancel() {
        let msg = RuntimeControl::Cancel {
            session_id: SessionId::generate(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"cancel""#));
    }
}
