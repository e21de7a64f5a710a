//! Bounded per-connection outbound queue.
//!
//! Producers (broadcast calls, possibly concurrent) push without ever
//! blocking; the connection's own session is the single consumer.
//!
//! Full-queue policy is drop-oldest with heartbeat priority:
//! - a notification pushed onto a full queue evicts the oldest queued
//!   notification and is appended at the back;
//! - a heartbeat is never evicted. When the queue is near full it is placed
//!   at the front, ahead of the backlog, and at most one heartbeat is ever
//!   pending (later ticks coalesce into it);
//! - a notification pushed onto a queue holding nothing but the pending
//!   heartbeat supersedes it; the notification carries liveness too;
//! - once `eviction_limit` evictions pile up without the consumer draining a
//!   single message, or nothing is evictable, the push is rejected with
//!   [`QueueRejected::Overflow`] and the caller closes the connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::OutboundMessage;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Sizing for one [`OutboundQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued messages.
    pub capacity: usize,
    /// Evictions tolerated between two consumer pops before overflow.
    pub eviction_limit: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            eviction_limit: 100,
        }
    }
}

/// How an accepted push was placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Stored without displacing anything.
    Appended,
    /// Stored after evicting the oldest queued notification.
    EvictedOldest,
    /// A heartbeat was already pending; nothing new was stored.
    Coalesced,
}

/// Why a push was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum QueueRejected {
    /// The backlog is saturated; the connection should be force-closed.
    #[error("outbound queue overflow")]
    Overflow,
    /// The queue was closed by teardown.
    #[error("outbound queue closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<OutboundMessage>>,
    closed: bool,
    heartbeat_pending: bool,
    evicted_since_pop: u64,
    evicted_total: u64,
}

impl QueueState {
    /// Remove the oldest evictable message, if any.
    fn evict_oldest(&mut self) -> bool {
        let Some(pos) = self
            .items
            .iter()
            .position(|m| m.message_type().is_evictable())
        else {
            return false;
        };
        let _ = self.items.remove(pos);
        self.evicted_since_pop += 1;
        self.evicted_total += 1;
        true
    }

    /// Drop the pending heartbeat if it is all that is queued.
    fn supersede_heartbeat(&mut self) -> bool {
        if !self.heartbeat_pending || !self.items.iter().all(|m| m.is_heartbeat()) {
            return false;
        }
        self.items.clear();
        self.heartbeat_pending = false;
        true
    }
}

/// Bounded FIFO of [`OutboundMessage`]s for one connection.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Enqueue a message. Never blocks.
    pub fn push(&self, message: Arc<OutboundMessage>) -> Result<Enqueued, QueueRejected> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueRejected::Closed);
            }
            if message.is_heartbeat() {
                self.push_heartbeat(&mut state, message)?
            } else {
                self.push_ordinary(&mut state, message)?
            }
        };
        if outcome != Enqueued::Coalesced {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    fn push_heartbeat(
        &self,
        state: &mut QueueState,
        message: Arc<OutboundMessage>,
    ) -> Result<Enqueued, QueueRejected> {
        if state.heartbeat_pending {
            return Ok(Enqueued::Coalesced);
        }
        let capacity = self.config.capacity;
        let outcome = if state.items.len() >= capacity {
            if !state.evict_oldest() {
                return Err(QueueRejected::Overflow);
            }
            Enqueued::EvictedOldest
        } else {
            Enqueued::Appended
        };
        // near full: jump the backlog so liveness is not starved
        if state.items.len() + 1 >= capacity {
            state.items.push_front(message);
        } else {
            state.items.push_back(message);
        }
        state.heartbeat_pending = true;
        Ok(outcome)
    }

    fn push_ordinary(
        &self,
        state: &mut QueueState,
        message: Arc<OutboundMessage>,
    ) -> Result<Enqueued, QueueRejected> {
        if state.items.len() < self.config.capacity {
            state.items.push_back(message);
            return Ok(Enqueued::Appended);
        }
        if state.supersede_heartbeat() {
            state.items.push_back(message);
            return Ok(Enqueued::Appended);
        }
        if state.evicted_since_pop >= self.config.eviction_limit || !state.evict_oldest() {
            return Err(QueueRejected::Overflow);
        }
        state.items.push_back(message);
        Ok(Enqueued::EvictedOldest)
    }

    /// Remove the next message without waiting.
    pub fn try_pop(&self) -> Option<Arc<OutboundMessage>> {
        let mut state = self.state.lock();
        let message = state.items.pop_front()?;
        if message.is_heartbeat() {
            state.heartbeat_pending = false;
        }
        state.evicted_since_pop = 0;
        Some(message)
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `None` when the timeout elapses or the queue is closed and
    /// empty.
    pub async fn pop(&self, timeout: Duration) -> Option<Arc<OutboundMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            // notify_one stores a permit, so a push racing this check is not lost
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Close the queue and discard its backlog.
    ///
    /// Returns the number of discarded messages. Idempotent.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            state.heartbeat_pending = false;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total evictions over the queue's lifetime.
    pub fn evicted_total(&self) -> u64 {
        self.state.lock().evicted_total
    }

    /// Copy of the queued messages, front first.
    pub fn snapshot(&self) -> Vec<Arc<OutboundMessage>> {
        self.state.lock().items.iter().cloned().collect()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
