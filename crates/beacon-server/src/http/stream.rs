//! `GET /notifications/stream`: the SSE endpoint.
//!
//! The recipient arrives already authenticated upstream, in the
//! `x-recipient-id` header or the `recipient` query parameter. A full or
//! shutting-down server answers `503` with `Retry-After` before any stream is
//! opened.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use beacon_core::{RecipientId, StreamError};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::ApiError;
use crate::server::AppState;
use crate::stream::{CloseReason, SseTransport, StreamSession};

/// Header carrying the authenticated recipient.
pub const RECIPIENT_HEADER: &str = "x-recipient-id";

/// Seconds a rejected client should wait before reconnecting.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Query parameters for the stream endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Recipient, when not sent as a header.
    pub recipient: Option<String>,
}

/// Header wins over query; blank values count as missing.
pub fn resolve_recipient(headers: &HeaderMap, params: &StreamParams) -> Option<RecipientId> {
    headers
        .get(RECIPIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(params.recipient.as_deref())
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(RecipientId::from)
}

fn capacity_rejection(max: usize) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
        Json(json!({
            "error": "capacity_exceeded",
            "message": format!("stream connection limit of {max} reached"),
            "max_connections": max,
        })),
    )
        .into_response()
}

fn shutdown_rejection() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
        Json(json!({
            "error": "shutting_down",
            "message": "server is shutting down",
        })),
    )
        .into_response()
}

/// GET /notifications/stream
pub async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Response {
    let Some(recipient) = resolve_recipient(&headers, &params) else {
        return ApiError::bad_request(format!(
            "missing recipient: send the {RECIPIENT_HEADER} header or ?recipient="
        ))
        .into_response();
    };

    if state.shutdown.is_shutting_down() {
        return shutdown_rejection();
    }

    let connection = match state.lifecycle.admit(recipient) {
        Ok(c) => c,
        Err(StreamError::CapacityExceeded { max }) => return capacity_rejection(max),
        Err(e) => {
            error!(error = %e, code = e.code(), "failed to admit stream connection");
            return ApiError::internal(e.to_string()).into_response();
        }
    };

    // close_all runs after cancellation and reaps anything admitted past here
    if state.shutdown.is_shutting_down() {
        let _ = connection.request_close(CloseReason::Shutdown);
        let _ = state.lifecycle.registry().deregister(connection.id());
        return shutdown_rejection();
    }

    let (transport, body) = SseTransport::channel(state.sse_buffer);
    let session = StreamSession::new(
        connection,
        Arc::clone(state.lifecycle.registry()),
        transport,
        state.session,
    );
    let _ = state.shutdown.spawn_session(session.run());

    Sse::new(body).into_response()
}
