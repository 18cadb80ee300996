//! The stateful `Session`: wires the sequencer, state machine, cancel
//! token, tool registry/dispatcher, and a sandbox adapter into the single
//! object a manager creates per `POST /sessions` or per runtime `execute`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use sbx_domain::config::LimitsConfig;
use sbx_domain::error::{BrokerError, Result};
use sbx_domain::event::{Event, EventBody, EncryptionInfo, FinalError, FinalStats};
use sbx_domain::ids::SessionId;
use sbx_domain::session::SessionState;
use sbx_domain::trace::TraceEvent;

use crate::cancel::CancelToken;
use crate::dispatcher::{PendingCallMap, ToolResultMessage};
use crate::encryption::SessionCipher;
use crate::registry::ToolRegistry;
use crate::sandbox::{ExecutionContext, SandboxAdapter, SandboxEvent, ToolError, ToolOutcome};
use crate::sequencer::EventSequencer;

/// Where a session's tool calls are routed.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Tool calls run in-process against the shared `ToolRegistry`.
    Embedded,
    /// Tool calls are dispatched to a connected runtime over its
    /// WebSocket; `PendingCallMap` correlates the eventual `tool_result`.
    Runtime(Arc<PendingCallMap>),
}

pub struct Session {
    pub id: SessionId,
    state: RwLock<SessionState>,
    pub sequencer: Arc<EventSequencer>,
    pub cancel: CancelToken,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    tool_call_count: AtomicU32,
    stdout_bytes: AtomicU64,
    limits: LimitsConfig,
    mode: ExecutionMode,
    /// `Some` once a session opts into the encryption overlay (§4.1,
    /// §9): every event published past `session_init` is sealed into an
    /// `encrypted` envelope before it reaches subscribers.
    cipher: Option<SessionCipher>,
}

impl Session {
    pub fn new(limits: LimitsConfig, mode: ExecutionMode, replay_capacity: usize) -> Arc<Self> {
        Self::with_id(SessionId::generate(), limits, mode, replay_capacity)
    }

    pub fn with_id(
        id: SessionId,
        limits: LimitsConfig,
        mode: ExecutionMode,
        replay_capacity: usize,
    ) -> Arc<Self> {
        Self::with_id_and_encryption(id, limits, mode, replay_capacity, false)
    }

    pub fn with_id_and_encryption(
        id: SessionId,
        limits: LimitsConfig,
        mode: ExecutionMode,
        replay_capacity: usize,
        encryption_enabled: bool,
    ) -> Arc<Self> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(limits.session_ttl_ms as i64);
        let cipher = if encryption_enabled {
            let mut key = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
            Some(SessionCipher::new(&key))
        } else {
            None
        };
        Arc::new(Self {
            id,
            state: RwLock::new(SessionState::Starting),
            sequencer: Arc::new(EventSequencer::new(replay_capacity)),
            cancel: CancelToken::new(),
            created_at: now,
            expires_at,
            tool_call_count: AtomicU32::new(0),
            stdout_bytes: AtomicU64::new(0),
            limits,
            mode,
            cipher,
        })
    }

    /// Publish `body` as the next event, sealing it into an `encrypted`
    /// envelope first if this session has an active encryption context
    /// (§4.1). The outer envelope's `seq` is the same one the plaintext
    /// event would have carried — "sequence numbering applies to the
    /// outer envelope" (§4.1).
    fn publish(&self, body: EventBody) -> Event {
        self.sequencer.publish(|seq| {
            let Some(cipher) = &self.cipher else {
                return Event::new(self.id.clone(), seq, body.clone());
            };
            let inner = Event::new(self.id.clone(), seq, body.clone());
            let plaintext = serde_json::to_vec(&inner).unwrap_or_default();
            match cipher.seal(&plaintext) {
                Ok((nonce_b64, ciphertext_b64)) => Event::new(
                    self.id.clone(),
                    seq,
                    EventBody::Encrypted {
                        kid: cipher.kid.to_string(),
                        nonce_b64,
                        ciphertext_b64,
                    },
                ),
                Err(err) => {
                    tracing::error!(session_id = %self.id, error = %err, "failed to seal event, emitting in clear");
                    inner
                }
            }
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, next: SessionState) -> std::result::Result<(), sbx_domain::session::IllegalTransition> {
        let current = *self.state.read();
        let resolved = sbx_domain::session::transition(current, next)?;
        TraceEvent::SessionStateChanged {
            session_id: self.id.to_string(),
            from: current.as_str(),
            to: resolved.as_str(),
        }
        .emit();
        *self.state.write() = resolved;
        Ok(())
    }

    pub fn tool_call_count(&self) -> u32 {
        self.tool_call_count.load(Ordering::Relaxed)
    }

    /// Emit `session_init`, run the sandbox to completion (or cancellation,
    /// or the TTL deadline), and emit `final`. Returns once the session has
    /// reached a terminal state.
    pub async fn run(
        self: Arc<Self>,
        code: String,
        adapter: Arc<dyn SandboxAdapter>,
        registry: Arc<ToolRegistry>,
    ) {
        // session_init itself always travels in the clear — it is the
        // event that announces whether encryption is active for
        // everything that follows it.
        self.sequencer.publish(|seq| {
            Event::new(
                self.id.clone(),
                seq,
                EventBody::SessionInit {
                    cancel_url: format!("/sessions/{}", self.id),
                    expires_at: self.expires_at,
                    encryption: EncryptionInfo {
                        enabled: self.cipher.is_some(),
                    },
                },
            )
        });

        TraceEvent::SessionCreated {
            session_id: self.id.to_string(),
            mode: match self.mode {
                ExecutionMode::Embedded => "embedded",
                ExecutionMode::Runtime(_) => "runtime",
            },
        }
        .emit();

        if self.set_state(SessionState::Running).is_err() {
            return;
        }

        if let ExecutionMode::Runtime(pending) = &self.mode {
            pending.send_control(sbx_protocol::RuntimeControl::Execute {
                session_id: self.id.clone(),
                code: code.clone(),
            });
        }

        let started = std::time::Instant::now();
        let remaining_ttl = (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::from_millis(0));
        let ttl = tokio::time::sleep(remaining_ttl);
        tokio::pin!(ttl);

        let heartbeat_session = self.clone();
        let heartbeat_interval = Duration::from_millis(self.limits.heartbeat_interval_ms);
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if heartbeat_session.state().is_terminal() {
                    break;
                }
                heartbeat_session.publish(EventBody::Heartbeat {});
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let run_future = adapter.run(ExecutionContext {
            code,
            events: events_tx,
            timeout: remaining_ttl,
            max_iterations: self.limits.max_iterations,
            max_tool_calls: self.limits.max_tool_calls,
            memory_limit: self.limits.memory_limit_bytes,
            abort_signal: self.cancel.clone(),
        });
        tokio::pin!(run_future);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut ttl => {
                    self.cancel.cancel();
                    break Err(BrokerError::SessionCancelled("ttl_expired".into()));
                }

                // Wakes the instant `cancel()` fires (client DELETE,
                // manager-driven reaping) instead of waiting for the next
                // tool call, stdout chunk, or the sandbox's own future to
                // resolve — a session idling in sandboxed code with no
                // I/O would otherwise linger until TTL.
                _ = self.cancel.cancelled() => {
                    break Err(BrokerError::SessionCancelled("cancelled".into()));
                }

                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(SandboxEvent::ToolInvocation(invocation)) => {
                            if self.cancel.is_cancelled() {
                                continue;
                            }
                            if self.tool_call_count.load(Ordering::Relaxed) >= self.limits.max_tool_calls {
                                break Err(BrokerError::MaxToolCallsExceeded { max: self.limits.max_tool_calls });
                            }
                            self.tool_call_count.fetch_add(1, Ordering::Relaxed);

                            if self.set_state(SessionState::WaitingForTool).is_err() {
                                break Err(BrokerError::SessionCancelled("illegal_state".into()));
                            }

                            let dispatch_start = std::time::Instant::now();
                            let tool_call_body = EventBody::ToolCall {
                                call_id: invocation.call_id.clone(),
                                tool_name: invocation.tool_name.clone(),
                                args: invocation.args.clone(),
                            };
                            // Published to the client (sealed if this
                            // session has encryption active)...
                            let client_tool_call_event = self.publish(tool_call_body.clone());
                            // ...but the runtime connection needs the
                            // plaintext callId/toolName/args to actually act
                            // on the call, so it gets its own clear-text copy
                            // at the same seq rather than the sealed one.
                            let runtime_tool_call_event =
                                Event::new(self.id.clone(), client_tool_call_event.seq, tool_call_body);
                            TraceEvent::ToolCallDispatched {
                                session_id: self.id.to_string(),
                                call_id: invocation.call_id.to_string(),
                                tool_name: invocation.tool_name.clone(),
                                routed_to: match self.mode {
                                    ExecutionMode::Embedded => "embedded",
                                    ExecutionMode::Runtime(_) => "runtime",
                                },
                            }
                            .emit();

                            // Per §7's propagation policy, everything here —
                            // validation/unknown-tool/secret failures, a
                            // runtime tool timeout or disconnect, a thrown
                            // handler — is *recoverable at the tool-call
                            // level*: it resolves the call with a failure the
                            // sandboxed code may catch, and the session keeps
                            // running. Only cancellation and the tool-call
                            // cap are fatal to the session itself.
                            let result: Result<serde_json::Value> =
                                match registry.validate_call(&invocation.tool_name, &invocation.args) {
                                    Ok(()) => match &self.mode {
                                        ExecutionMode::Embedded => {
                                            registry
                                                .execute(
                                                    &invocation.tool_name,
                                                    invocation.args.clone(),
                                                    &self.id,
                                                    &invocation.call_id,
                                                    &self.cancel,
                                                )
                                                .await
                                        }
                                        ExecutionMode::Runtime(pending) => {
                                            pending
                                                .dispatch_and_wait(
                                                    self.id.clone(),
                                                    invocation.call_id.clone(),
                                                    runtime_tool_call_event,
                                                    Duration::from_millis(self.limits.tool_timeout_ms),
                                                )
                                                .await
                                                .and_then(|message| {
                                                    if message.ok {
                                                        Ok(message.value.unwrap_or(serde_json::Value::Null))
                                                    } else {
                                                        Err(BrokerError::ExecutionError(
                                                            message.error.unwrap_or_default(),
                                                        ))
                                                    }
                                                })
                                        }
                                    },
                                    Err(validation_err) => Err(validation_err),
                                };

                            TraceEvent::ToolCallCompleted {
                                session_id: self.id.to_string(),
                                call_id: invocation.call_id.to_string(),
                                ok: result.is_ok(),
                                duration_ms: dispatch_start.elapsed().as_millis() as u64,
                            }
                            .emit();

                            self.emit_tool_result_applied(&invocation.call_id);

                            if !self.cancel.is_cancelled() {
                                let _ = self.set_state(SessionState::Running);
                            }

                            let outcome = match result {
                                Ok(value) => ToolOutcome {
                                    ok: true,
                                    value: Some(value),
                                    error: None,
                                },
                                Err(err) => ToolOutcome {
                                    ok: false,
                                    value: None,
                                    error: Some(ToolError {
                                        code: err.code().to_string(),
                                        message: err.to_string(),
                                    }),
                                },
                            };
                            let _ = invocation.result.send(outcome);
                        }
                        Some(SandboxEvent::Stdout(bytes)) => {
                            let total = self.stdout_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
                            if total > self.limits.max_stdout_bytes {
                                break Err(BrokerError::ExecutionError("stdout limit exceeded".into()));
                            }
                        }
                        None => {
                            // Adapter dropped its sender; fall through to
                            // awaiting the run future directly below.
                        }
                    }
                }

                outcome = &mut run_future => {
                    break outcome.map(|o| (o.ok, o.result, o.error));
                }
            }

            if self.cancel.is_cancelled() {
                break Err(BrokerError::SessionCancelled("cancelled".into()));
            }
        };

        heartbeat_handle.abort();
        adapter.dispose().await;

        let stats = FinalStats {
            duration_ms: started.elapsed().as_millis() as u64,
            tool_call_count: self.tool_call_count.load(Ordering::Relaxed),
            stdout_bytes: self.stdout_bytes.load(Ordering::Relaxed),
        };

        let (final_body, next_state, reason) = match outcome {
            Ok((ok, result, error)) => (
                EventBody::Final {
                    ok,
                    result,
                    // An uncaught tool-call failure carries its original
                    // taxonomy code (UNKNOWN_TOOL, TOOL_TIMEOUT, ...) through
                    // unchanged (§8 scenario 5); a sandbox-native fault falls
                    // back to the generic EXECUTION_ERROR.
                    error: error.map(|e| FinalError {
                        code: e.code,
                        message: e.message,
                    }),
                    stats,
                },
                if ok { SessionState::Completed } else { SessionState::Failed },
                if ok { "completed" } else { "execution_failed" },
            ),
            Err(err) => {
                let next = match &err {
                    BrokerError::SessionCancelled(_) => SessionState::Cancelled,
                    _ => SessionState::Failed,
                };
                (
                    EventBody::Final {
                        ok: false,
                        result: None,
                        error: Some(FinalError {
                            code: err.code().into(),
                            message: err.to_string(),
                        }),
                        stats,
                    },
                    next,
                    "error",
                )
            }
        };

        // §4.2's cancel() procedure is explicit: a cancelled session emits
        // a non-recoverable `error` event ahead of its `final`, whether the
        // cancellation came from an explicit `cancel()` call or the TTL
        // deadline firing.
        if next_state == SessionState::Cancelled {
            self.publish(EventBody::Error {
                code: "SESSION_CANCELLED".into(),
                message: "session cancelled".into(),
                recoverable: false,
            });
        }

        self.publish(final_body);
        let _ = self.set_state(next_state);
        TraceEvent::SessionTerminated {
            session_id: self.id.to_string(),
            reason: reason.to_string(),
            tool_call_count: self.tool_call_count.load(Ordering::Relaxed),
        }
        .emit();
    }

    fn emit_tool_result_applied(&self, call_id: &sbx_domain::ids::CallId) {
        self.publish(EventBody::ToolResultApplied {
            call_id: call_id.clone(),
        });
    }

    /// Apply a `tool_result` message arriving from a runtime connection.
    /// Only meaningful in `ExecutionMode::Runtime`.
    pub fn apply_tool_result(&self, call_id: sbx_domain::ids::CallId, message: ToolResultMessage) -> bool {
        match &self.mode {
            ExecutionMode::Runtime(pending) => pending.complete(&call_id, message),
            ExecutionMode::Embedded => false,
        }
    }
}
