//! Session manager (§4.6): the in-memory registry of live sessions, a cap
//! on concurrent sessions, and a periodic reaper for expired or terminal
//! entries.
//!
//! Unlike the chat-style session stores elsewhere in this workspace,
//! broker sessions are never persisted to disk — a session only exists for
//! the lifetime of one sandboxed execution, and a crash mid-run has
//! nothing useful to resume.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use sbx_domain::config::LimitsConfig;
use sbx_domain::error::{BrokerError, Result};
use sbx_domain::ids::SessionId;
use sbx_domain::session::{SessionInfo, SessionState};
use sbx_domain::trace::TraceEvent;

use crate::cancel::CancelMap;
use crate::dispatcher::PendingCallMap;
use crate::registry::ToolRegistry;
use crate::sandbox::SandboxAdapter;
use crate::session::{ExecutionMode, Session};

/// What `SessionManager::execute_and_wait` hands back once a session has
/// run to completion: the `final` event's payload plus every event the
/// session emitted along the way, in `seq` order (§4.6).
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<sbx_domain::event::FinalError>,
    pub stats: sbx_domain::event::FinalStats,
    pub events: Vec<sbx_domain::event::Event>,
}

/// A client-supplied, per-session tightening or relaxing of select limits,
/// carried in `POST /sessions`'s `config` field (§4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionLimitsOverride {
    pub max_tool_calls: Option<u32>,
    pub session_ttl_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    /// Opts this session into the per-session encryption overlay (§4.1).
    pub encryption_enabled: bool,
}

pub struct SessionManager {
    limits: LimitsConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    cancels: Arc<CancelMap>,
    registry: Arc<ToolRegistry>,
    adapter: Arc<dyn SandboxAdapter>,
    runtime_pending: Option<Arc<PendingCallMap>>,
}

impl SessionManager {
    pub fn new(
        limits: LimitsConfig,
        registry: Arc<ToolRegistry>,
        adapter: Arc<dyn SandboxAdapter>,
        runtime_pending: Option<Arc<PendingCallMap>>,
    ) -> Self {
        Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            cancels: Arc::new(CancelMap::new()),
            registry,
            adapter,
            runtime_pending,
        }
    }

    /// Create a session and spawn its execution loop. Returns the session
    /// handle immediately — the caller subscribes to its sequencer to
    /// stream events as they're produced.
    pub fn create(&self, code: String) -> Result<Arc<Session>> {
        self.create_with(code, None, None)
    }

    /// Create a session, optionally with a client-supplied ID and a
    /// per-session override of select limits (§4.8's `POST /sessions`
    /// `sessionId?`/`config?` fields). The override only ever tightens or
    /// relaxes `maxToolCalls`/`sessionTtlMs`/`heartbeatIntervalMs`; every
    /// other limit stays at the broker-wide value.
    pub fn create_with(
        &self,
        code: String,
        session_id: Option<SessionId>,
        limits_override: Option<SessionLimitsOverride>,
    ) -> Result<Arc<Session>> {
        self.create_with_subscriber(code, session_id, limits_override)
            .map(|(session, _rx)| session)
    }

    /// Same as `create_with`, but also subscribes to the session's live
    /// event stream *before* spawning its execution task, so the returned
    /// receiver is guaranteed to observe `session_init` (seq=1) onward with
    /// no gap — subscribing only after this call returns would race the
    /// spawned task, which may already have emitted events by the time a
    /// caller gets around to subscribing.
    pub fn create_with_subscriber(
        &self,
        code: String,
        session_id: Option<SessionId>,
        limits_override: Option<SessionLimitsOverride>,
    ) -> Result<(Arc<Session>, tokio::sync::broadcast::Receiver<sbx_domain::event::Event>)> {
        {
            let sessions = self.sessions.read();
            let live = sessions.values().filter(|s| !s.state().is_terminal()).count();
            if live >= self.limits.max_sessions {
                return Err(BrokerError::MaxSessions {
                    max: self.limits.max_sessions,
                });
            }
            if let Some(id) = &session_id {
                if sessions.contains_key(id) {
                    return Err(BrokerError::InvalidRequest(format!(
                        "session {id} already exists"
                    )));
                }
            }
        }

        let mut limits = self.limits;
        let mut encryption_enabled = false;
        if let Some(overrides) = limits_override {
            if let Some(max_tool_calls) = overrides.max_tool_calls {
                limits.max_tool_calls = max_tool_calls;
            }
            if let Some(session_ttl_ms) = overrides.session_ttl_ms {
                limits.session_ttl_ms = session_ttl_ms;
            }
            if let Some(heartbeat_interval_ms) = overrides.heartbeat_interval_ms {
                limits.heartbeat_interval_ms = heartbeat_interval_ms;
            }
            encryption_enabled = overrides.encryption_enabled;
        }

        let mode = match &self.runtime_pending {
            Some(pending) => ExecutionMode::Runtime(pending.clone()),
            None => ExecutionMode::Embedded,
        };
        let id = session_id.unwrap_or_else(SessionId::generate);
        let session = Session::with_id_and_encryption(
            id,
            limits,
            mode,
            limits.replay_buffer_capacity,
            encryption_enabled,
        );
        self.cancels.register(session.id.clone());
        self.sessions.write().insert(session.id.clone(), session.clone());

        let rx = session.sequencer.subscribe();

        let spawned = session.clone();
        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            spawned.run(code, adapter, registry).await;
        });

        Ok((session, rx))
    }

    /// Create a session, subscribe before the session's own task can race
    /// ahead of us, drain every event through to `final`, and tear the
    /// session down immediately rather than waiting for TTL-based reaping
    /// (§4.6: "creates, executes, drains, cleans up"). Intended for
    /// embedders that want a single future rather than the HTTP/WebSocket
    /// transports — the `doctor` CLI's smoke-test path uses this.
    pub async fn execute_and_wait(
        &self,
        code: String,
        session_id: Option<SessionId>,
        limits_override: Option<SessionLimitsOverride>,
        mut on_event: Option<&mut dyn FnMut(&sbx_domain::event::Event)>,
    ) -> Result<FinalResult> {
        let (session, mut rx) = self.create_with_subscriber(code, session_id, limits_override)?;
        let mut events = Vec::new();

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(cb) = on_event.as_deref_mut() {
                        cb(&event);
                    }
                    let is_final = matches!(event.body, sbx_domain::event::EventBody::Final { .. });
                    events.push(event);
                    if is_final {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // The live channel dropped events under backpressure;
                    // fall back to the replay buffer for whatever is left.
                    events = session.sequencer.replay_from(1)?;
                    if events
                        .last()
                        .map(|e| matches!(e.body, sbx_domain::event::EventBody::Final { .. }))
                        .unwrap_or(false)
                    {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        let final_event = events
            .last()
            .cloned()
            .ok_or_else(|| BrokerError::ExecutionError("session closed without a final event".into()))?;
        let id = session.id.clone();
        self.sessions.write().remove(&id);
        self.cancels.remove(&id);

        match final_event.body {
            sbx_domain::event::EventBody::Final { ok, result, error, stats } => {
                Ok(FinalResult { ok, result, error, stats, events })
            }
            _ => Err(BrokerError::ExecutionError("last event was not final".into())),
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Cancel a session (and any sessions registered as its children).
    pub fn cancel(&self, id: &SessionId) -> Result<()> {
        let session = self.get(id).ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        if session.state().is_terminal() {
            return Err(BrokerError::NotFound(id.to_string()));
        }
        self.cancels.cancel(id);
        session.cancel.cancel();
        if let Some(pending) = &self.runtime_pending {
            pending.send_control(sbx_protocol::RuntimeControl::Cancel {
                session_id: id.clone(),
            });
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|session| SessionInfo {
                session_id: session.id.clone(),
                state: session.state(),
                created_at: session.created_at,
                expires_at: session.expires_at,
                tool_call_count: session.tool_call_count(),
                last_seq: session.sequencer.last_seq(),
            })
            .collect()
    }

    pub fn list_active(&self) -> Vec<SessionInfo> {
        self.list().into_iter().filter(|s| s.state != SessionState::Completed
            && s.state != SessionState::Cancelled
            && s.state != SessionState::Failed).collect()
    }

    /// Drop terminal sessions whose TTL has elapsed, freeing their replay
    /// buffers and cancel tokens. Called on a periodic timer from the
    /// gateway binary.
    pub fn cleanup(&self) -> usize {
        let now = chrono::Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.state().is_terminal() || s.expires_at < now)
            .map(|s| s.id.clone())
            .collect();

        let mut sessions = self.sessions.write();
        for id in &expired {
            sessions.remove(id);
            self.cancels.remove(id);
            TraceEvent::SessionReaped {
                session_id: id.to_string(),
                expired: true,
                terminal: true,
            }
            .emit();
        }
        expired.len()
    }

    /// Cancel every live session. Called on shutdown.
    pub fn dispose(&self) {
        let ids: Vec<SessionId> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.state().is_terminal())
            .map(|s| s.id.clone())
            .collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::reference::ReferenceAdapter;

    fn test_manager() -> SessionManager {
        SessionManager::new(
            LimitsConfig {
                max_sessions: 2,
                ..LimitsConfig::default()
            },
            Arc::new(ToolRegistry::new()),
            Arc::new(ReferenceAdapter),
            None,
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let manager = test_manager();
        let session = manager.create("echo:hi".into()).unwrap();
        assert!(manager.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let manager = test_manager();
        manager.create("echo:a".into()).unwrap();
        manager.create("echo:b".into()).unwrap();
        let err = manager.create("echo:c".into()).unwrap_err();
        assert_eq!(err.code(), "MAX_SESSIONS");
    }

    #[test]
    fn cancel_unknown_session_is_not_found() {
        let manager = test_manager();
        let err = manager.cancel(&SessionId::generate()).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn create_with_honors_a_client_supplied_id() {
        let manager = test_manager();
        let id = SessionId::generate();
        let session = manager
            .create_with("echo:hi".into(), Some(id.clone()), None)
            .unwrap();
        assert_eq!(session.id, id);
    }

    #[tokio::test]
    async fn create_with_rejects_a_colliding_id() {
        let manager = test_manager();
        let id = SessionId::generate();
        manager
            .create_with("echo:hi".into(), Some(id.clone()), None)
            .unwrap();
        let err = manager
            .create_with("echo:bye".into(), Some(id), None)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn cleanup_reaps_a_completed_session_before_its_ttl_expires() {
        let manager = SessionManager::new(
            LimitsConfig {
                session_ttl_ms: 60_000,
                ..LimitsConfig::default()
            },
            Arc::new(ToolRegistry::new()),
            Arc::new(ReferenceAdapter),
            None,
        );
        let session = manager.create("echo:hi".into()).unwrap();
        for _ in 0..100 {
            if session.state().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.state().is_terminal());
        assert!(session.expires_at > chrono::Utc::now());

        let reaped = manager.cleanup();
        assert_eq!(reaped, 1);
        assert!(manager.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn create_with_applies_a_limits_override() {
        let manager = test_manager();
        let session = manager
            .create_with(
                "echo:hi".into(),
                None,
                Some(SessionLimitsOverride {
                    max_tool_calls: Some(1),
                    ..Default::default()
                }),
            )
            .unwrap();
        assert!(manager.get(&session.id).is_some());
    }
}
