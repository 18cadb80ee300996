use std::sync::Arc;

use sbx_broker::dispatcher::PendingCallMap;
use sbx_broker::registry::ToolRegistry;
use sbx_broker::sandbox::SandboxAdapter;
use sbx_broker::SessionManager;
use sbx_domain::config::Config;

/// Shared application state passed to every API handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<ToolRegistry>,
    /// `Some` only when `config.runtime.runtime_ws` is set — the pending
    /// map shared between the runtime WebSocket handler and every session
    /// running in runtime mode.
    pub runtime_pending: Option<Arc<PendingCallMap>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, tools: Arc<ToolRegistry>, adapter: Arc<dyn SandboxAdapter>) -> Self {
        let runtime_pending = if config.runtime.runtime_ws.is_some() {
            Some(Arc::new(PendingCallMap::new(config.limits.max_pending_tool_calls)))
        } else {
            None
        };
        let sessions = Arc::new(SessionManager::new(
            config.limits,
            tools.clone(),
            adapter,
            runtime_pending.clone(),
        ));
        Self {
            config,
            sessions,
            tools,
            runtime_pending,
        }
    }
}
