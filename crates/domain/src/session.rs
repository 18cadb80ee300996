//! Session state machine (§4.2).
//!
//! `SessionState` transitions are validated here as pure data so both the
//! broker's runtime engine and its tests can reason about legality without
//! touching any async or lock machinery.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    WaitingForTool,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::WaitingForTool => "waiting_for_tool",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        }
    }

    /// A session in a terminal state accepts no further tool calls or
    /// cancellation and is eligible for reaping once its TTL also passes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Whether `self -> next` is an allowed edge per §4.2's state diagram.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Starting, Cancelled)
                | (Running, WaitingForTool)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (WaitingForTool, Running)
                | (WaitingForTool, Failed)
                | (WaitingForTool, Cancelled)
        )
    }
}

/// Attempt a transition, returning the new state or the reason it's illegal.
pub fn transition(
    current: SessionState,
    next: SessionState,
) -> Result<SessionState, IllegalTransition> {
    if current.is_terminal() {
        return Err(IllegalTransition {
            from: current,
            to: next,
            reason: "session already in a terminal state",
        });
    }
    if current.can_transition_to(next) {
        Ok(next)
    } else {
        Err(IllegalTransition {
            from: current,
            to: next,
            reason: "no such edge in the session state diagram",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal session transition {from:?} -> {to:?}: {reason}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: &'static str,
}

/// Snapshot of a session's public state, as returned by the listing and
/// detail HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub state: SessionState,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "toolCallCount")]
    pub tool_call_count: u32,
    #[serde(rename = "lastSeq")]
    pub last_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_can_move_to_running_or_fail_early() {
        assert!(SessionState::Starting.can_transition_to(SessionState::Running));
        assert!(SessionState::Starting.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Starting.can_transition_to(SessionState::WaitingForTool));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        for terminal in [
            SessionState::Completed,
            SessionState::Cancelled,
            SessionState::Failed,
        ] {
            assert!(transition(terminal, SessionState::Running).is_err());
        }
    }

    #[test]
    fn waiting_for_tool_round_trips_to_running() {
        assert_eq!(
            transition(SessionState::WaitingForTool, SessionState::Running).unwrap(),
            SessionState::Running
        );
    }

    #[test]
    fn cancellation_is_reachable_from_every_non_terminal_state() {
        for state in [
            SessionState::Starting,
            SessionState::Running,
            SessionState::WaitingForTool,
        ] {
            assert!(state.can_transition_to(SessionState::Cancelled));
        }
    }
}
