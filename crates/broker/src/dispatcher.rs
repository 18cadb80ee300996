//! Runtime-mode tool call dispatch (§4.3): a pending-call map keyed by
//! `CallId`, each entry holding a oneshot sender that the matching
//! `tool_result` message (arriving later on the runtime WebSocket)
//! resolves. Grounded on the same pending/oneshot/timeout shape this
//! workspace already uses to correlate a dispatched unit of work with an
//! asynchronous reply from a remote worker.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use sbx_domain::error::{BrokerError, Result};
use sbx_domain::event::Event;
use sbx_domain::ids::{CallId, SessionId};
use sbx_protocol::RuntimeControl;

/// A frame destined for the connected runtime over its WebSocket: either a
/// session event duplicated so the runtime can see it (`tool_call`, per
/// §4.3 runtime mode step 1), or a control message outside the event
/// stream (`execute`, `cancel`).
#[derive(Debug, Clone)]
pub enum RuntimeFrame {
    Event(Event),
    Control(RuntimeControl),
}

/// Outbound capacity for the runtime broadcast channel. A connection that
/// falls behind this many frames drops them silently on the subscriber
/// side (the session's own sequencer remains the source of truth).
const RUNTIME_OUTBOUND_CAPACITY: usize = 256;

pub struct ToolResultMessage {
    pub ok: bool,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

struct PendingCall {
    session_id: SessionId,
    reply: oneshot::Sender<ToolResultMessage>,
}

pub struct PendingCallMap {
    pending: Mutex<HashMap<CallId, PendingCall>>,
    max_pending: usize,
    outbound: broadcast::Sender<RuntimeFrame>,
}

impl Default for PendingCallMap {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PendingCallMap {
    pub fn new(max_pending: usize) -> Self {
        let (outbound, _rx) = broadcast::channel(RUNTIME_OUTBOUND_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            max_pending,
            outbound,
        }
    }

    /// Subscribe to frames destined for the runtime connection. Used by the
    /// gateway's WebSocket handler to forward duplicated `tool_call` events
    /// and control messages out over the wire.
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<RuntimeFrame> {
        self.outbound.subscribe()
    }

    /// Tell the connected runtime to start (or abandon) a session. A no-op
    /// if no runtime is currently subscribed.
    pub fn send_control(&self, message: RuntimeControl) {
        let _ = self.outbound.send(RuntimeFrame::Control(message));
    }

    /// Register `call_id` as awaiting a reply, duplicate `tool_call_event`
    /// out to the runtime connection, and wait for a reply (or the given
    /// timeout, or runtime disconnection) to resolve.
    pub async fn dispatch_and_wait(
        &self,
        session_id: SessionId,
        call_id: CallId,
        tool_call_event: Event,
        timeout: Duration,
    ) -> Result<ToolResultMessage> {
        let rx = {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                return Err(BrokerError::ExecutionError(
                    "too many tool calls in flight for this runtime connection".into(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(
                call_id.clone(),
                PendingCall {
                    session_id,
                    reply: tx,
                },
            );
            rx
        };

        let _ = self.outbound.send(RuntimeFrame::Event(tool_call_event));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => {
                // Sender dropped without a reply — e.g. the map was cleared
                // on disconnect — treat as runtime disconnection.
                Err(BrokerError::RuntimeDisconnected)
            }
            Err(_elapsed) => {
                self.pending.lock().remove(&call_id);
                Err(BrokerError::ToolTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Resolve a pending call with the runtime's `tool_result` message.
    /// Returns `false` if no such call was pending (already timed out, or
    /// a stale/duplicate reply).
    pub fn complete(&self, call_id: &CallId, message: ToolResultMessage) -> bool {
        let pending = self.pending.lock().remove(call_id);
        match pending {
            Some(entry) => entry.reply.send(message).is_ok(),
            None => false,
        }
    }

    /// Drop every pending call belonging to `session_id` with a runtime
    /// disconnection error. Used when a runtime connection closes mid-flight.
    pub fn fail_pending_for_session(&self, session_id: &SessionId) -> usize {
        let mut pending = self.pending.lock();
        let stale: Vec<CallId> = pending
            .iter()
            .filter(|(_, entry)| &entry.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            if let Some(entry) = pending.remove(&id) {
                // Drop the sender: the waiting `dispatch_and_wait` sees a
                // closed channel and reports `RuntimeDisconnected`.
                drop(entry.reply);
            }
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending call, across every session, with a runtime
    /// disconnection error. Called when the (single) runtime connection
    /// closes — §4.9's "on socket close: fail every pending call".
    pub fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (_, entry) in pending.drain() {
            drop(entry.reply);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_domain::event::EventBody;

    fn tool_call_event(session_id: SessionId, call_id: CallId) -> Event {
        Event::new(
            session_id,
            1,
            EventBody::ToolCall {
                call_id,
                tool_name: "echo".into(),
                args: serde_json::json!({}),
            },
        )
    }

    #[tokio::test]
    async fn complete_resolves_the_waiter() {
        let map = PendingCallMap::new(8);
        let session = SessionId::generate();
        let call = CallId::generate();

        let map_clone = &map;
        let call_clone = call.clone();
        let session_clone = session.clone();
        let event = tool_call_event(session.clone(), call.clone());
        let waiter = tokio::spawn(async move {
            map_clone
                .dispatch_and_wait(session_clone, call_clone, event, Duration::from_secs(5))
                .await
        });

        // Give the waiter a tick to register before completing.
        tokio::task::yield_now().await;
        assert!(map.complete(
            &call,
            ToolResultMessage {
                ok: true,
                value: Some(serde_json::json!(42)),
                error: None,
            }
        ));

        let result = waiter.await.unwrap().unwrap();
        assert!(result.ok);
        assert_eq!(result.value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn dispatch_duplicates_the_tool_call_to_the_outbound_channel() {
        let map = PendingCallMap::new(8);
        let session = SessionId::generate();
        let call = CallId::generate();
        let mut outbound = map.subscribe_outbound();

        let event = tool_call_event(session.clone(), call.clone());
        let map_clone = &map;
        let waiter = tokio::spawn(async move {
            map_clone
                .dispatch_and_wait(session, call, event, Duration::from_secs(5))
                .await
        });

        match outbound.recv().await.unwrap() {
            RuntimeFrame::Event(e) => assert!(matches!(e.body, EventBody::ToolCall { .. })),
            RuntimeFrame::Control(_) => panic!("expected an event frame"),
        }

        waiter.abort();
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_entry() {
        let map = PendingCallMap::new(8);
        let session = SessionId::generate();
        let call = CallId::generate();
        let event = tool_call_event(session.clone(), call.clone());
        let err = map
            .dispatch_and_wait(session, call.clone(), event, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOOL_TIMEOUT");
        assert_eq!(map.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_pending_for_session_drains_only_matching_entries() {
        let map = PendingCallMap::new(8);
        let session_a = SessionId::generate();
        let session_b = SessionId::generate();
        let call_a = CallId::generate();
        let call_b = CallId::generate();

        let waiter_a = {
            let map = &map;
            let call_a = call_a.clone();
            let session_a = session_a.clone();
            let event = tool_call_event(session_a.clone(), call_a.clone());
            tokio::spawn(async move {
                map.dispatch_and_wait(session_a, call_a, event, Duration::from_secs(5)).await
            })
        };
        let waiter_b = {
            let map = &map;
            let call_b = call_b.clone();
            let event = tool_call_event(session_b.clone(), call_b.clone());
            tokio::spawn(async move {
                map.dispatch_and_wait(session_b, call_b, event, Duration::from_secs(5)).await
            })
        };
        tokio::task::yield_now().await;

        let drained = map.fail_pending_for_session(&session_a);
        assert_eq!(drained, 1);

        let result_a = waiter_a.await.unwrap();
        assert!(result_a.is_err());
        assert_eq!(map.pending_count(), 1);

        map.complete(
            &call_b,
            ToolResultMessage {
                ok: true,
                value: None,
                error: None,
            },
        );
        assert!(waiter_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rejects_dispatch_once_at_capacity() {
        let map = PendingCallMap::new(1);
        let session = SessionId::generate();
        let _rx = {
            let (tx, rx) = oneshot::channel::<ToolResultMessage>();
            map.pending.lock().insert(
                CallId::generate(),
                PendingCall {
                    session_id: session.clone(),
                    reply: tx,
                },
            );
            rx
        };
        let call = CallId::generate();
        let event = tool_call_event(session.clone(), call.clone());
        let err = map
            .dispatch_and_wait(session, call, event, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn fail_all_drains_every_session() {
        let map = PendingCallMap::new(8);
        let session_a = SessionId::generate();
        let session_b = SessionId::generate();
        let call_a = CallId::generate();
        let call_b = CallId::generate();

        let waiter_a = {
            let map = &map;
            let event = tool_call_event(session_a.clone(), call_a.clone());
            let session_a = session_a.clone();
            let call_a = call_a.clone();
            tokio::spawn(async move {
                map.dispatch_and_wait(session_a, call_a, event, Duration::from_secs(5)).await
            })
        };
        let waiter_b = {
            let map = &map;
            let event = tool_call_event(session_b.clone(), call_b.clone());
            tokio::spawn(async move {
                map.dispatch_and_wait(session_b, call_b, event, Duration::from_secs(5)).await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(map.fail_all(), 2);
        assert!(waiter_a.await.unwrap().is_err());
        assert!(waiter_b.await.unwrap().is_err());
        assert_eq!(map.pending_count(), 0);
    }
}
