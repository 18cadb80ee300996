//! HTTP surface for sessions (§4.8): create-and-stream, replay-and-follow,
//! list, get, and cancel.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use sbx_broker::filter::{EventFilter, FilterSpec};
use sbx_broker::{SessionLimitsOverride, SessionManager};
use sbx_domain::error::BrokerError;
use sbx_domain::event::{Event, EventBody};
use sbx_domain::ids::SessionId;

use crate::error::ApiError;
use crate::state::AppState;

/// Cancels the session if the stream is dropped (client disconnect) before
/// a `final` event was observed (§4.8: "client disconnect during streaming
/// ... the session is cancelled unless already terminal"). A session that
/// reaches `final` on its own marks the guard completed, so resuming a
/// finished session's replay never fires a spurious cancel.
struct DisconnectGuard {
    sessions: std::sync::Arc<SessionManager>,
    session_id: SessionId,
    completed: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.sessions.cancel(&self.session_id);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub code: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub config: Option<CreateSessionConfig>,
    pub filter: Option<FilterSpec>,
}

/// The per-session overrides a caller may pass under `config` (§4.8). Only
/// these limits can be narrowed or widened per session; everything
/// else stays at the broker-wide value from the resolved `Config`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionConfig {
    #[serde(rename = "maxToolCalls")]
    pub max_tool_calls: Option<u32>,
    #[serde(rename = "sessionTtlMs")]
    pub session_ttl_ms: Option<u64>,
    #[serde(rename = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: Option<u64>,
    /// Opts this session into the per-session AES-GCM event overlay
    /// (§3's `session_init.encryption.enabled`).
    #[serde(rename = "encryption", default)]
    pub encryption_enabled: bool,
}

/// `POST /sessions` — start a session and stream its events back as
/// NDJSON for as long as the client stays connected. The session keeps
/// running even if the client disconnects early; it can be resumed via
/// `GET /sessions/{id}/stream`.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    let session_id = request
        .session_id
        .map(SessionId::parse)
        .transpose()
        .map_err(|e| BrokerError::InvalidRequest(e.to_string()))?;

    let overrides = request.config.map(|c| SessionLimitsOverride {
        max_tool_calls: c.max_tool_calls,
        session_ttl_ms: c.session_ttl_ms,
        heartbeat_interval_ms: c.heartbeat_interval_ms,
        encryption_enabled: c.encryption_enabled,
    });

    let filter = request
        .filter
        .map(EventFilter::compile)
        .transpose()?
        .map(std::sync::Arc::new);

    let (session, rx) = state
        .sessions
        .create_with_subscriber(request.code, session_id, overrides)?;
    let session_id = session.id.clone();

    let guard = DisconnectGuard {
        sessions: state.sessions.clone(),
        session_id: session_id.clone(),
        completed: false,
    };

    let body = axum::body::Body::from_stream(ndjson_stream(rx, filter, Some(guard), 0));
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/x-ndjson"));
    response.headers_mut().insert(
        "x-session-id",
        HeaderValue::from_str(&session_id.to_string()).unwrap(),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "fromSeq")]
    pub from_seq: Option<u64>,
    pub filter: Option<String>,
}

/// `GET /sessions/{id}/stream?fromSeq=N&filter=...` — replay buffered
/// events from `fromSeq` (default: 1, i.e. everything still buffered) and
/// then continue following live events as NDJSON.
pub async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::parse(session_id).map_err(|e| BrokerError::InvalidRequest(e.to_string()))?;
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| BrokerError::NotFound(session_id.to_string()))?;

    let filter = match &query.filter {
        Some(raw) => {
            let spec: FilterSpec =
                serde_json::from_str(raw).map_err(|e| BrokerError::InvalidFilter(e.to_string()))?;
            Some(std::sync::Arc::new(EventFilter::compile(spec)?))
        }
        None => None,
    };

    let from_seq = query.from_seq.unwrap_or(1);
    sbx_domain::trace::TraceEvent::ReplayRequested {
        session_id: session_id.to_string(),
        from_seq,
        last_seq: session.sequencer.last_seq(),
    }
    .emit();
    // Subscribe *before* snapshotting the replay buffer: the sequencer
    // appends to the buffer and broadcasts under the same write lock
    // (`EventSequencer::publish`), so subscribing first guarantees every
    // event that lands in the buffer after this point also reaches `live`.
    // The cost is that an event published in the gap between subscribing
    // and snapshotting can show up in both places, so `live` is filtered
    // below to only forward events past the snapshot's last seq.
    let mut live = session.sequencer.subscribe();
    let backlog = session.sequencer.replay_from(from_seq)?;
    let already_terminal = session.state().is_terminal();
    let backlog_last_seq = backlog.last().map(|e| e.seq).unwrap_or(from_seq.saturating_sub(1));

    let backlog_filter = filter.clone();
    let backlog_stream = futures_util::stream::iter(
        backlog
            .into_iter()
            .filter(move |e| backlog_filter.as_deref().map(|f| f.should_send(e)).unwrap_or(true))
            .map(event_to_line),
    );

    // A terminal session will never publish another event; chaining the
    // live half would block the stream open forever. Replay-only in that
    // case so the response closes once the backlog is drained (§7: "the
    // last event on every stream is exactly one `final`").
    let body = if already_terminal {
        axum::body::Body::from_stream(backlog_stream)
    } else {
        let guard = DisconnectGuard {
            sessions: state.sessions.clone(),
            session_id: session_id.clone(),
            completed: false,
        };
        axum::body::Body::from_stream(
            backlog_stream.chain(ndjson_stream(live, filter, Some(guard), backlog_last_seq)),
        )
    };

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/x-ndjson"));
    Ok(response)
}

/// `GET /sessions` — list sessions, newest state snapshot per session.
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.sessions.list() }))
}

/// `GET /sessions/{id}` — a single session's current snapshot.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::parse(session_id).map_err(|e| BrokerError::InvalidRequest(e.to_string()))?;
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| BrokerError::NotFound(session_id.to_string()))?;
    Ok(Json(sbx_domain::session::SessionInfo {
        session_id: session.id.clone(),
        state: session.state(),
        created_at: session.created_at,
        expires_at: session.expires_at,
        tool_call_count: session.tool_call_count(),
        last_seq: session.sequencer.last_seq(),
    })
    .into_response())
}

/// `DELETE /sessions/{id}` — cancel a running session.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::parse(session_id).map_err(|e| BrokerError::InvalidRequest(e.to_string()))?;
    state.sessions.cancel(&session_id)?;
    Ok(Json(serde_json::json!({ "success": true, "sessionId": session_id.to_string() })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sbx_broker::registry::{ToolCallContext, ToolHandler, ToolRegistry};
    use sbx_broker::sandbox::reference::ReferenceAdapter;
    use sbx_domain::config::Config;
    use sbx_domain::tool::ToolMeta;

    fn test_state() -> AppState {
        test_state_with_registry(ToolRegistry::new())
    }

    fn test_state_with_registry(registry: ToolRegistry) -> AppState {
        AppState::new(
            std::sync::Arc::new(Config::default()),
            std::sync::Arc::new(registry),
            std::sync::Arc::new(ReferenceAdapter),
        )
    }

    /// A tool handler that never returns, so a session that calls it sits
    /// in `WaitingForTool` for as long as the test needs it to.
    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn call(&self, _args: serde_json::Value, _ctx: &ToolCallContext<'_>) -> sbx_domain::error::Result<serde_json::Value> {
            std::future::pending().await
        }
    }

    async fn drain(response: Response) -> Vec<Event> {
        let body = response.into_body();
        let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn create_session_streams_session_init_through_final() {
        let state = test_state();
        let response = create_session(
            State(state),
            Json(CreateSessionRequest {
                code: "const:{\"answer\":42}".into(),
                session_id: None,
                config: None,
                filter: None,
            }),
        )
        .await
        .unwrap();

        let events = drain(response).await;
        assert!(matches!(events.first().unwrap().body, EventBody::SessionInit { .. }));
        let last = events.last().unwrap();
        match &last.body {
            EventBody::Final { ok, result, .. } => {
                assert!(*ok);
                assert_eq!(result.as_ref().unwrap()["answer"], 42);
            }
            other => panic!("expected a final event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_failing_script_ends_in_a_non_ok_final() {
        let state = test_state();
        let response = create_session(
            State(state),
            Json(CreateSessionRequest {
                code: "fail".into(),
                session_id: None,
                config: None,
                filter: None,
            }),
        )
        .await
        .unwrap();

        let events = drain(response).await;
        match &events.last().unwrap().body {
            EventBody::Final { ok, error, .. } => {
                assert!(!*ok);
                assert_eq!(error.as_ref().unwrap().code, "EXECUTION_ERROR");
            }
            other => panic!("expected a final event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_through_list_get_and_cancel() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolMeta::new("slow", "never completes", serde_json::json!({"type": "object"})),
                std::sync::Arc::new(SlowHandler),
            )
            .unwrap();
        let state = test_state_with_registry(registry);

        // This session's only tool call never resolves, so it stays
        // non-terminal for as long as the test needs it for list/get/cancel.
        let (session, _rx) = state
            .sessions
            .create_with_subscriber("call_tool:slow {}".into(), None, None)
            .unwrap();
        let session_id = session.id.clone();

        let listed = list_sessions(State(state.clone())).await.into_response();
        let body = axum::body::to_bytes(listed.into_body(), 1024 * 1024).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

        let got = get_session(State(state.clone()), Path(session_id.to_string()))
            .await
            .unwrap();
        assert_eq!(got.status(), StatusCode::OK);

        let cancelled = cancel_session(State(state.clone()), Path(session_id.to_string()))
            .await
            .unwrap();
        let body = axum::body::to_bytes(cancelled.into_body(), 1024).await.unwrap();
        let cancelled: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(cancelled["success"], true);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_session_is_not_found() {
        let state = test_state();
        let err = cancel_session(State(state), Path(SessionId::generate().to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err.0, BrokerError::NotFound(_)));
    }

    /// Routes through the full axum router (CORS layer included) rather
    /// than calling a handler directly, so route wiring itself is covered.
    #[tokio::test]
    async fn router_creates_and_lists_a_session_end_to_end() {
        use tower::ServiceExt;

        let state = test_state();
        let router = crate::api::router(state.clone()).with_state(state);

        let create = axum::http::Request::builder()
            .method("POST")
            .uri("/sessions")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::json!({ "code": "const:{\"ok\":true}" }).to_string(),
            ))
            .unwrap();
        let response = router.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get("x-session-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        drain(response).await;

        let list = axum::http::Request::builder()
            .method("GET")
            .uri("/sessions")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.clone().oneshot(list).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(listed["sessions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["sessionId"] == session_id));
    }
}

fn event_to_line(event: Event) -> Result<axum::body::Bytes, std::convert::Infallible> {
    let mut line = serde_json::to_vec(&event).unwrap_or_default();
    line.push(b'\n');
    Ok(axum::body::Bytes::from(line))
}

/// Turn a broadcast receiver of `Event`s into an NDJSON byte stream: one
/// JSON object per line, honoring `filter` if present. A lagged receiver
/// ends the stream rather than silently skip seq numbers — the client
/// should reconnect via `GET /sessions/{id}/stream?fromSeq=...` to replay
/// from its buffer instead.
fn ndjson_stream(
    mut rx: tokio::sync::broadcast::Receiver<Event>,
    filter: Option<std::sync::Arc<EventFilter>>,
    mut guard: Option<DisconnectGuard>,
    skip_up_to_seq: u64,
) -> impl Stream<Item = Result<axum::body::Bytes, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.seq <= skip_up_to_seq {
                        // Already delivered via the replay backlog (§9's
                        // subscribe-before-snapshot race, see stream_session).
                        continue;
                    }
                    let is_final = matches!(event.body, EventBody::Final { .. });
                    if filter.as_deref().map(|f| f.should_send(&event)).unwrap_or(true) {
                        yield event_to_line(event);
                    }
                    if is_final {
                        if let Some(guard) = guard.as_mut() {
                            guard.completed = true;
                        }
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => break,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        // `guard` is dropped here, whether we reached `final` normally or
        // the caller dropped this stream early (client disconnect).
    }
}
