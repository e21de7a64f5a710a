//! Error taxonomy for the notification fan-out core.
//!
//! Every per-connection variant is contained to the session that raised it;
//! only [`StreamError::InvalidConfig`] is fatal, and only at startup.

use std::time::Duration;

use thiserror::Error;

use crate::ids::ConnectionId;

/// Errors raised by the registry, queues, sessions, and scheduler.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Registration rejected because the global connection cap is reached.
    #[error("connection capacity exceeded (max {max})")]
    CapacityExceeded {
        /// Configured maximum number of live connections.
        max: usize,
    },

    /// A connection's backlog could not absorb a message even after eviction.
    #[error("outbound queue overflow on connection {connection_id}")]
    QueueOverflow {
        /// Connection that was forced closed.
        connection_id: ConnectionId,
    },

    /// Write or read failure on the underlying stream.
    #[error("transport failure on connection {connection_id}: {reason}")]
    TransportFailure {
        /// Affected connection.
        connection_id: ConnectionId,
        /// What went wrong.
        reason: String,
    },

    /// No traffic within the configured idle window.
    #[error("connection {connection_id} idle for {idle:?}")]
    IdleTimeout {
        /// Affected connection.
        connection_id: ConnectionId,
        /// How long the connection had been idle.
        idle: Duration,
    },

    /// The connection already left the `connecting` state.
    #[error("connection {connection_id} is no longer connecting")]
    ConnectionClosed {
        /// Affected connection.
        connection_id: ConnectionId,
    },

    /// Startup configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StreamError {
    /// Machine-readable code, used in HTTP rejection bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::TransportFailure { .. } => "transport_failure",
            Self::IdleTimeout { .. } => "idle_timeout",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Whether this error is scoped to a single connection.
    pub fn is_per_connection(&self) -> bool {
        !matches!(self, Self::CapacityExceeded { .. } | Self::InvalidConfig(_))
    }
}

/// Result type for fan-out operations.
pub type Result<T> = std::result::Result<T, StreamError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
