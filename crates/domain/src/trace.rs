use serde::Serialize;

/// Structured trace events emitted across the broker crates.
///
/// Each variant is serialized to JSON and logged at `info` under a single
/// `trace_event` field, so a log pipeline can index on `event` without
/// parsing free-text messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
        mode: &'static str,
    },
    SessionStateChanged {
        session_id: String,
        from: &'static str,
        to: &'static str,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
        tool_call_count: u32,
    },
    SessionReaped {
        session_id: String,
        expired: bool,
        terminal: bool,
    },
    ToolCallDispatched {
        session_id: String,
        call_id: String,
        tool_name: String,
        routed_to: &'static str,
    },
    ToolCallCompleted {
        session_id: String,
        call_id: String,
        ok: bool,
        duration_ms: u64,
    },
    /// The runtime WebSocket connection closed; every still-pending call
    /// across every session routed through it was failed as a result.
    RuntimeDisconnected {
        failed_in_flight: usize,
    },
    ReplayRequested {
        session_id: String,
        from_seq: u64,
        last_seq: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sbx_event");
    }
}
