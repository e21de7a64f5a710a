//! Outbound stream messages and their wire shape.
//!
//! Every message is serialized as a flat JSON object tagged by `type`:
//!
//! | `type` | Fields |
//! |--------|--------|
//! | `connection_established` | `recipient`, `timestamp`, `message` |
//! | `heartbeat` | `timestamp` |
//! | `notification` | `notification_id`, `timestamp`, `recipient`, `data` |
//!
//! Messages are immutable once built and are shared as `Arc<OutboundMessage>`
//! between the broadcaster and every session that writes them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{NotificationId, RecipientId};

/// Greeting sent as the first frame of every stream.
pub const CONNECTION_ESTABLISHED_TEXT: &str = "Notification stream connected";

/// Discriminant of an [`OutboundMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First frame after a session becomes active.
    ConnectionEstablished,
    /// Periodic keep-alive.
    Heartbeat,
    /// Addressed event from the ingestion pipeline.
    Notification,
}

impl MessageType {
    /// Wire name, also used as the SSE `event:` field and metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::Heartbeat => "heartbeat",
            Self::Notification => "notification",
        }
    }

    /// Whether a full queue may evict this message to make room.
    ///
    /// Only notifications are evictable; liveness frames never are.
    pub fn is_evictable(self) -> bool {
        matches!(self, Self::Notification)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message queued for delivery to one or more streaming clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent once, immediately after a session becomes active.
    ConnectionEstablished {
        /// Recipient the stream is bound to.
        recipient: RecipientId,
        /// Creation time.
        timestamp: DateTime<Utc>,
        /// Human-readable greeting.
        message: String,
    },
    /// Keep-alive emitted by the heartbeat scheduler.
    Heartbeat {
        /// Creation time.
        timestamp: DateTime<Utc>,
    },
    /// Event addressed to a recipient.
    Notification {
        /// Unique notification ID.
        notification_id: NotificationId,
        /// Creation time.
        timestamp: DateTime<Utc>,
        /// Addressed recipient.
        recipient: RecipientId,
        /// Opaque payload from the ingestion collaborator.
        data: Value,
    },
}

impl OutboundMessage {
    /// Build the greeting frame for a newly active session.
    pub fn connection_established(recipient: RecipientId) -> Self {
        Self::ConnectionEstablished {
            recipient,
            timestamp: Utc::now(),
            message: CONNECTION_ESTABLISHED_TEXT.to_owned(),
        }
    }

    /// Build a heartbeat stamped with the current time.
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Build a notification with a fresh ID.
    pub fn notification(recipient: RecipientId, data: Value) -> Self {
        Self::notification_with_id(NotificationId::new(), recipient, data)
    }

    /// Build a notification with a caller-chosen ID.
    pub fn notification_with_id(
        notification_id: NotificationId,
        recipient: RecipientId,
        data: Value,
    ) -> Self {
        Self::Notification {
            notification_id,
            timestamp: Utc::now(),
            recipient,
            data,
        }
    }

    /// The message's type tag.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionEstablished { .. } => MessageType::ConnectionEstablished,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::Notification { .. } => MessageType::Notification,
        }
    }

    /// When the message was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ConnectionEstablished { timestamp, .. }
            | Self::Heartbeat { timestamp }
            | Self::Notification { timestamp, .. } => *timestamp,
        }
    }

    /// Notification ID, if this is a notification.
    pub fn notification_id(&self) -> Option<&NotificationId> {
        match self {
            Self::Notification {
                notification_id, ..
            } => Some(notification_id),
            _ => None,
        }
    }

    /// Shorthand for `message_type() == Heartbeat`.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }

    /// Serialize to the JSON wire shape.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
