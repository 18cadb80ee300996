//! Session cancellation (§4.2, §4.6): a cheap, lock-free-to-read flag per
//! session, plus an async `cancelled()` wait so a task parked in a
//! `select!` wakes the instant cancellation fires instead of having to
//! poll `is_cancelled()` on some other timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use sbx_domain::ids::SessionId;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel()` has been called, including calls that
    /// already happened before this future was created. Meant to be used
    /// as a `select!` branch rather than polled in a loop.
    pub async fn cancelled(&self) {
        // The `Notified` future must be created before the flag is
        // checked, or a `cancel()` landing in between the check and the
        // `.await` would be missed.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<SessionId, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, returning its token.
    pub fn register(&self, session_id: SessionId) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(session_id, token.clone());
        token
    }

    /// Cancel a session. Returns `false` if no such session is registered.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let tokens = self.tokens.lock();
        match tokens.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &SessionId) {
        self.tokens.lock().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_not_cancelled_until_cancel_is_called() {
        let map = CancelMap::new();
        let session = SessionId::generate();
        let token = map.register(session.clone());
        assert!(!token.is_cancelled());
        assert!(map.cancel(&session));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelling_unknown_session_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel(&SessionId::generate()));
    }

    #[tokio::test]
    async fn cancelled_wakes_a_task_already_waiting_on_it() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
