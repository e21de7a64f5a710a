//! Webhook ingestion: validate, screen, stamp, broadcast.
//!
//! Two sources post here: zone/port events and vessel events. Bodies are
//! JSON objects addressed by a string `recipient`; everything else in the
//! body is passed through to the stream untouched, plus `received_at` and
//! `source`. Nothing is persisted.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use beacon_core::{NotificationId, OutboundMessage, RecipientId};
use chrono::Utc;
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::ApiError;
use crate::classification::Screening;
use crate::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::server::AppState;

/// Where a webhook event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    /// `POST /notifications/webhook/zone-port-event`
    ZonePort,
    /// `POST /notifications/webhook/vessel-event`
    Vessel,
}

impl EventSource {
    /// Label stamped into the payload and used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZonePort => "zone_port_event",
            Self::Vessel => "vessel_event",
        }
    }

    fn accepted_text(self) -> &'static str {
        match self {
            Self::ZonePort => "Notification dispatched",
            Self::Vessel => "Vessel notification dispatched",
        }
    }
}

/// A validated webhook event ready to broadcast.
#[derive(Debug)]
pub struct WebhookEvent {
    /// Addressed recipient.
    pub recipient: RecipientId,
    /// Original body plus `received_at` and `source`.
    pub data: Value,
}

impl WebhookEvent {
    /// Validate a raw body and stamp it.
    pub fn parse(body: Value, source: EventSource) -> Result<Self, ApiError> {
        let Value::Object(mut map) = body else {
            return Err(ApiError::bad_request("webhook body must be a JSON object"));
        };
        let recipient = map
            .get("recipient")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(RecipientId::from)
            .ok_or_else(|| ApiError::bad_request("webhook body requires a string `recipient`"))?;

        let _ = map.insert("received_at".into(), json!(Utc::now().to_rfc3339()));
        let _ = map.insert("source".into(), json!(source.as_str()));
        Ok(Self {
            recipient,
            data: Value::Object(map),
        })
    }
}

/// POST /notifications/webhook/zone-port-event
pub async fn zone_port_event(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    ingest(&state, EventSource::ZonePort, body)
}

/// POST /notifications/webhook/vessel-event
pub async fn vessel_event(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    ingest(&state, EventSource::Vessel, body)
}

fn ingest(
    state: &AppState,
    source: EventSource,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return ApiError::bad_request(rejection.body_text()).into_response(),
    };
    let event = match WebhookEvent::parse(body, source) {
        Ok(event) => event,
        Err(e) => return e.into_response(),
    };

    if source == EventSource::Vessel {
        if let Some(index) = &state.classifier {
            if let Screening::Filtered { vessel_type } = index.screen(&event.data) {
                debug!(recipient = %event.recipient, ?vessel_type, "vessel event filtered by type");
                return (
                    StatusCode::OK,
                    Json(json!({
                        "status": "filtered",
                        "message": "Vessel type not in requested categories",
                    })),
                )
                    .into_response();
            }
        }
    }

    let notification_id = NotificationId::new();
    let message =
        OutboundMessage::notification_with_id(notification_id.clone(), event.recipient.clone(), event.data);
    let report = state.broadcaster.send_to(&event.recipient, message);

    counter!(WEBHOOK_EVENTS_TOTAL, "source" => source.as_str()).increment(1);
    info!(
        source = source.as_str(),
        recipient = %event.recipient,
        %notification_id,
        delivered = report.delivered,
        dropped = report.dropped,
        "webhook event dispatched"
    );

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": source.accepted_text(),
            "notification_id": notification_id,
            "delivery": report,
        })),
    )
        .into_response()
}
