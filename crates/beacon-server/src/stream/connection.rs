//! One streaming client connection and its lifecycle state.

use std::fmt;
use std::time::Duration;

use beacon_core::{ConnectionId, RecipientId, StreamError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::queue::{OutboundQueue, QueueConfig};

/// Position in the `connecting → active → closing → closed` machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress; not yet visible to broadcasts.
    Connecting,
    /// Registered and draining its queue.
    Active,
    /// Close requested; teardown pending or running.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a connection left the `active` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away.
    ClientDisconnect,
    /// A transport write failed or timed out.
    TransportFailure,
    /// No delivery within the idle window.
    IdleTimeout,
    /// The backlog saturated.
    QueueOverflow,
    /// The connection outlived the configured maximum age.
    LifetimeExceeded,
    /// Process shutdown.
    Shutdown,
    /// Removed from the registry without a more specific reason.
    Deregistered,
}

impl CloseReason {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client_disconnect",
            Self::TransportFailure => "transport_failure",
            Self::IdleTimeout => "idle_timeout",
            Self::QueueOverflow => "queue_overflow",
            Self::LifetimeExceeded => "lifetime_exceeded",
            Self::Shutdown => "shutdown",
            Self::Deregistered => "deregistered",
        }
    }
}

impl CloseReason {
    /// The close reason a per-connection error maps to.
    ///
    /// `None` for process-level errors, which never close a single stream.
    pub fn for_error(err: &StreamError) -> Option<Self> {
        if !err.is_per_connection() {
            return None;
        }
        Some(match err {
            StreamError::QueueOverflow { .. } => Self::QueueOverflow,
            StreamError::TransportFailure { .. } => Self::TransportFailure,
            StreamError::IdleTimeout { .. } => Self::IdleTimeout,
            _ => Self::Deregistered,
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

/// A live (or closing) streaming connection.
///
/// The registry holds the canonical `Arc`; the session holds a working
/// reference for the duration of its loop.
pub struct Connection {
    id: ConnectionId,
    recipient: RecipientId,
    queue: OutboundQueue,
    created_at: DateTime<Utc>,
    opened: Instant,
    last_activity: Mutex<Instant>,
    lifecycle: Mutex<Lifecycle>,
    close_signal: CancellationToken,
}

impl Connection {
    /// Create a connection in the `connecting` state with a fresh ID.
    pub fn new(recipient: RecipientId, queue: QueueConfig) -> Self {
        Self::with_id(ConnectionId::new(), recipient, queue)
    }

    /// Create a connection with a caller-chosen ID.
    pub fn with_id(id: ConnectionId, recipient: RecipientId, queue: QueueConfig) -> Self {
        let now = Instant::now();
        Self {
            id,
            recipient,
            queue: OutboundQueue::new(queue),
            created_at: Utc::now(),
            opened: now,
            last_activity: Mutex::new(now),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                reason: None,
            }),
            close_signal: CancellationToken::new(),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Recipient this connection subscribes under.
    pub fn recipient(&self) -> &RecipientId {
        &self.recipient
    }

    /// Outbound backlog.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// Reason recorded by the first close request, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().reason
    }

    /// `connecting → active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state != ConnectionState::Connecting {
            return false;
        }
        lc.state = ConnectionState::Active;
        drop(lc);
        self.touch();
        true
    }

    /// Move to `closing` and wake the session.
    ///
    /// Only the first request wins and records its reason; later calls
    /// return `false`.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            ConnectionState::Connecting | ConnectionState::Active => {
                lc.state = ConnectionState::Closing;
                lc.reason = Some(reason);
                drop(lc);
                self.close_signal.cancel();
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    /// Enter the terminal state.
    pub fn mark_closed(&self) {
        let mut lc = self.lifecycle.lock();
        lc.state = ConnectionState::Closed;
        drop(lc);
        self.close_signal.cancel();
    }

    /// Resolves once a close has been requested.
    pub fn close_requested(&self) -> WaitForCancellationFuture<'_> {
        self.close_signal.cancelled()
    }

    /// Record delivery activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last delivery (or activation).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("recipient", &self.recipient)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
