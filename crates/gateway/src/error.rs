//! Maps `BrokerError` onto the HTTP surface (§7): a JSON body shaped
//! `{code, message}` with the status from `BrokerError::http_status`, or
//! 500 for anything the taxonomy didn't expect to reach an HTTP response
//! directly (those are supposed to only ever appear inside an event
//! stream's `error`/`final` events).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use sbx_domain::error::BrokerError;

pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .http_status()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if self.0.http_status().is_none() {
            tracing::warn!(code = self.0.code(), "error surfaced to HTTP with no mapped status");
        }

        (
            status,
            Json(serde_json::json!({
                "code": self.0.code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
