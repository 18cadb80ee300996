//! The runtime WebSocket endpoint (§4.9): a single duplex connection a
//! remote runtime dials into. Outbound frames are session events
//! (`tool_call` duplicated, per §4.3 Runtime mode step 1) and control
//! messages (`execute`, `cancel`); inbound frames are `tool_result` and
//! `completed` from `sbx_protocol::RuntimeInbound`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use sbx_broker::dispatcher::ToolResultMessage;
use sbx_broker::RuntimeFrame;
use sbx_protocol::RuntimeInbound;

use crate::state::AppState;

/// `GET /runtime/ws` — only routed when the broker is configured with
/// `--runtime-ws`/`runtime.runtime_ws` (see `api::router`).
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let Some(pending) = state.runtime_pending.clone() else {
        return;
    };

    let (mut sink, mut stream) = socket.split();

    let mut outbound = pending.subscribe_outbound();
    let writer = tokio::spawn(async move {
        loop {
            match outbound.recv().await {
                Ok(frame) => {
                    let text = match frame {
                        RuntimeFrame::Event(event) => serde_json::to_string(&event),
                        RuntimeFrame::Control(control) => serde_json::to_string(&control),
                    };
                    let Ok(text) = text else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(inbound) = serde_json::from_str::<RuntimeInbound>(&text) else {
            tracing::warn!("runtime ws: dropped unparseable frame");
            continue;
        };
        match inbound {
            RuntimeInbound::ToolResult {
                session_id: _,
                call_id,
                ok,
                value,
                error,
            } => {
                pending.complete(&call_id, ToolResultMessage { ok, value, error });
            }
            RuntimeInbound::Completed { session_id, ok, error, .. } => {
                // This endpoint only externalizes tool-call fulfillment
                // (see DESIGN.md); sandboxed code always runs through the
                // configured `SandboxAdapter`, which already produces its
                // own completion. A runtime's own completion report is
                // informational only.
                tracing::debug!(%session_id, ok, error = error.as_deref().unwrap_or(""), "runtime reported completion");
            }
        }
    }

    let failed = pending.fail_all();
    if failed > 0 {
        sbx_domain::trace::TraceEvent::RuntimeDisconnected { failed_in_flight: failed }.emit();
    }
    writer.abort();
}
