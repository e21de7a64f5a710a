//! HTTP handlers: stream endpoint, webhook ingestion, root greeting.

pub mod stream;
pub mod webhook;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Greeting returned by `GET /`.
pub const WELCOME_MESSAGE: &str = "Welcome to the Beacon notification server";

/// JSON error body `{ "error": code, "message": text }` with a status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// `400 Bad Request`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    /// `500 Internal Server Error`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.code, "message": self.message })),
        )
            .into_response()
    }
}

/// GET /
pub async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": WELCOME_MESSAGE }))
}
