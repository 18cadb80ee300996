/// Stable error taxonomy shared by every broker crate.
///
/// `.code()` is the wire contract (§7 of the design): clients match on the
/// string, never on the `Display` text.
#[derive(thiserror::Error, Debug, Clone)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("broker is shutting down")]
    ServiceUnavailable,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("session cap reached ({max})")]
    MaxSessions { max: usize },

    #[error("tool not registered: {0}")]
    UnknownTool(String),

    #[error("argument validation failed: {0}")]
    ValidationError(String),

    #[error("required secret missing: {0}")]
    SecretError(String),

    #[error("tool handler error: {0}")]
    ExecutionError(String),

    #[error("tool call timed out after {timeout_ms}ms")]
    ToolTimeout { timeout_ms: u64 },

    #[error("runtime disconnected mid-call")]
    RuntimeDisconnected,

    #[error("session exceeded max tool calls ({max})")]
    MaxToolCallsExceeded { max: u32 },

    #[error("session cancelled: {0}")]
    SessionCancelled(String),

    #[error("sandbox execution timed out")]
    ExecutionTimeout,

    #[error("execution aborted")]
    ExecutionAborted,

    #[error("unsupported protocol version")]
    UnsupportedProtocol,

    #[error("replay buffer no longer contains seq {requested} (low water mark {low_water})")]
    StreamGap { requested: u64, low_water: u64 },
}

impl BrokerError {
    /// The stable wire code from the error taxonomy table.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidRequest(_) => "INVALID_REQUEST",
            BrokerError::NotFound(_) => "NOT_FOUND",
            BrokerError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            BrokerError::InvalidFilter(_) => "INVALID_FILTER",
            BrokerError::MaxSessions { .. } => "MAX_SESSIONS",
            BrokerError::UnknownTool(_) => "UNKNOWN_TOOL",
            BrokerError::ValidationError(_) => "VALIDATION_ERROR",
            BrokerError::SecretError(_) => "SECRET_ERROR",
            BrokerError::ExecutionError(_) => "EXECUTION_ERROR",
            BrokerError::ToolTimeout { .. } => "TOOL_TIMEOUT",
            BrokerError::RuntimeDisconnected => "RUNTIME_DISCONNECTED",
            BrokerError::MaxToolCallsExceeded { .. } => "MAX_TOOL_CALLS_EXCEEDED",
            BrokerError::SessionCancelled(_) => "SESSION_CANCELLED",
            BrokerError::ExecutionTimeout => "EXECUTION_TIMEOUT",
            BrokerError::ExecutionAborted => "EXECUTION_ABORTED",
            BrokerError::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            BrokerError::StreamGap { .. } => "STREAM_GAP",
        }
    }

    /// HTTP status for errors surfaced directly as HTTP responses (§7).
    /// Errors that are only ever surfaced inside an event stream (tool_call
    /// failures, session-terminal errors) return `None`.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            BrokerError::InvalidRequest(_) | BrokerError::InvalidFilter(_) => Some(400),
            BrokerError::NotFound(_) => Some(404),
            BrokerError::ServiceUnavailable => Some(503),
            BrokerError::MaxSessions { .. } => Some(429),
            BrokerError::StreamGap { .. } => Some(410),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(BrokerError::UnknownTool("x".into()).code(), "UNKNOWN_TOOL");
        assert_eq!(
            BrokerError::MaxToolCallsExceeded { max: 50 }.code(),
            "MAX_TOOL_CALLS_EXCEEDED"
        );
    }

    #[test]
    fn only_http_surfaced_errors_carry_a_status() {
        assert_eq!(BrokerError::NotFound("s_x".into()).http_status(), Some(404));
        assert_eq!(BrokerError::UnknownTool("x".into()).http_status(), None);
    }
}
