pub mod sessions;

use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::runtime_ws;
use crate::state::AppState;

/// Build the full API router (§4.8, §4.9).
///
/// The runtime WebSocket route is only mounted when the broker was started
/// with `--runtime-ws`/`runtime.runtime_ws` set — without it there is no
/// `PendingCallMap` for the handler to forward frames through.
pub fn router(state: AppState) -> Router<AppState> {
    let mut router = Router::new()
        .route("/sessions", post(sessions::create_session))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id", delete(sessions::cancel_session))
        .route("/sessions/:id/stream", get(sessions::stream_session));

    if state.runtime_pending.is_some() {
        router = router.route("/runtime/ws", get(runtime_ws::handler));
    }

    router
        .layer(build_cors_layer(&state.config.server.cors))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Build a [`CorsLayer`] from the configured allowed origins (§4.8's CORS
/// preflight requirement). A lone `"*"` entry turns on fully permissive
/// CORS; otherwise each origin must parse as a literal `HeaderValue`.
fn build_cors_layer(cors: &sbx_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    for origin in &cors.allowed_origins {
        match origin.parse::<HeaderValue>() {
            Ok(hv) => exact.push(hv),
            Err(_) => tracing::warn!(origin = %origin, "invalid CORS origin, skipping"),
        }
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
