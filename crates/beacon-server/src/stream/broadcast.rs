//! Recipient-addressed fan-out onto connection queues.
//!
//! Every send works on a registry snapshot, so connections joining or leaving
//! mid-broadcast never stall it. Pushes never block. A connection whose
//! queue overflows is force-closed after the loop; the broadcast itself still
//! reports success for everyone else.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{ConnectionId, OutboundMessage, RecipientId, StreamError};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection};
use super::queue::{Enqueued, QueueRejected};
use super::registry::ConnectionRegistry;
use crate::metrics::{BROADCAST_DROPS_TOTAL, BROADCAST_EVICTIONS_TOTAL, BROADCAST_MESSAGES_TOTAL};

/// What happened to one connection during a broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Accepted into the queue.
    Delivered,
    /// Accepted after evicting the oldest queued notification.
    DeliveredWithEviction,
    /// A heartbeat was already pending for this connection.
    Coalesced,
    /// The queue saturated; the connection was closed.
    Overflowed,
    /// The connection was already tearing down.
    Closed,
}

impl DeliveryOutcome {
    /// Whether the message ended up (or already was) in the queue.
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::DeliveredWithEviction | Self::Coalesced
        )
    }
}

/// Per-broadcast accounting returned to the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections the message was offered to.
    pub attempted: usize,
    /// Connections that accepted it.
    pub delivered: usize,
    /// Connections that refused it (overflowed or closing).
    pub dropped: usize,
    /// Older notifications evicted to make room.
    pub evicted: usize,
    /// Outcome per connection.
    pub outcomes: HashMap<ConnectionId, DeliveryOutcome>,
}

impl DeliveryReport {
    fn record(&mut self, id: ConnectionId, outcome: DeliveryOutcome) {
        self.attempted += 1;
        if outcome.is_accepted() {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
        if outcome == DeliveryOutcome::DeliveredWithEviction {
            self.evicted += 1;
        }
        let _ = self.outcomes.insert(id, outcome);
    }

    /// Outcome for one connection, if it was targeted.
    pub fn outcome(&self, id: &ConnectionId) -> Option<DeliveryOutcome> {
        self.outcomes.get(id).copied()
    }
}

/// Pushes messages onto the queues of matching connections.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver to every connection of `recipient`.
    ///
    /// An unknown recipient yields an empty report; nothing is stored.
    pub fn send_to(&self, recipient: &RecipientId, message: OutboundMessage) -> DeliveryReport {
        let targets = self.registry.lookup(recipient);
        self.deliver(&targets, message, recipient.as_str())
    }

    /// Deliver to every registered connection. Used for heartbeats.
    pub fn send_to_all(&self, message: OutboundMessage) -> DeliveryReport {
        let targets = self.registry.all();
        self.deliver(&targets, message, "all")
    }

    fn deliver(
        &self,
        targets: &[Arc<Connection>],
        message: OutboundMessage,
        label: &str,
    ) -> DeliveryReport {
        let message = Arc::new(message);
        let message_type = message.message_type();
        let mut report = DeliveryReport::default();
        let mut overflowed = Vec::new();

        for conn in targets {
            let outcome = match conn.queue().push(Arc::clone(&message)) {
                Ok(Enqueued::Appended) => DeliveryOutcome::Delivered,
                Ok(Enqueued::EvictedOldest) => {
                    counter!(BROADCAST_EVICTIONS_TOTAL).increment(1);
                    DeliveryOutcome::DeliveredWithEviction
                }
                Ok(Enqueued::Coalesced) => DeliveryOutcome::Coalesced,
                Err(QueueRejected::Overflow) => {
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    let err = StreamError::QueueOverflow {
                        connection_id: conn.id().clone(),
                    };
                    warn!(
                        error = %err,
                        code = err.code(),
                        recipient = %conn.recipient(),
                        queued = conn.queue().len(),
                        evicted = conn.queue().evicted_total(),
                        "disconnecting slow client"
                    );
                    let reason = CloseReason::for_error(&err).unwrap_or(CloseReason::QueueOverflow);
                    let _ = conn.request_close(reason);
                    overflowed.push(conn.id().clone());
                    DeliveryOutcome::Overflowed
                }
                Err(QueueRejected::Closed) => DeliveryOutcome::Closed,
            };
            report.record(conn.id().clone(), outcome);
        }

        for id in &overflowed {
            let _ = self.registry.deregister(id);
        }

        counter!(BROADCAST_MESSAGES_TOTAL, "type" => message_type.as_str()).increment(1);
        debug!(
            message_type = message_type.as_str(),
            label,
            attempted = report.attempted,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast message"
        );
        report
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use beacon_core::{MessageType, NotificationId};
    use serde_json::json;

    use super::*;
    use crate::stream::connection::ConnectionState;
    use crate::stream::queue::QueueConfig;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(100));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        (registry, broadcaster)
    }

    fn join(
        registry: &ConnectionRegistry,
        id: &str,
        recipient: &str,
        queue: QueueConfig,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::with_id(
            ConnectionId::from(id),
            RecipientId::from(recipient),
            queue,
        ));
        registry.register(Arc::clone(&conn)).unwrap();
        conn
    }

    fn notification(recipient: &str) -> OutboundMessage {
        OutboundMessage::notification(RecipientId::from(recipient), json!({"event": "port_arrival"}))
    }

    #[test]
    fn unknown_recipient_is_an_empty_report() {
        let (_registry, broadcaster) = setup();
        let report = broadcaster.send_to(&RecipientId::from("nobody"), notification("nobody"));
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn both_tabs_of_a_recipient_receive_one_copy() {
        let (registry, broadcaster) = setup();
        let c1 = join(&registry, "c1", "u1", QueueConfig::default());
        let c2 = join(&registry, "c2", "u1", QueueConfig::default());

        let id = NotificationId::from("n-42");
        let message =
            OutboundMessage::notification_with_id(id.clone(), RecipientId::from("u1"), json!({}));
        let report = broadcaster.send_to(&RecipientId::from("u1"), message);

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        for conn in [&c1, &c2] {
            let queued = conn.queue().snapshot();
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].message_type(), MessageType::Notification);
            assert_eq!(queued[0].notification_id(), Some(&id));
        }

        let other = broadcaster.send_to(&RecipientId::from("u2"), notification("u2"));
        assert_eq!(other.attempted, 0);
        assert_eq!(c1.queue().len(), 1);
        assert_eq!(c2.queue().len(), 1);
    }

    #[test]
    fn send_to_all_reaches_every_connection() {
        let (registry, broadcaster) = setup();
        let conns: Vec<_> = (0..5)
            .map(|n| join(&registry, &format!("c{n}"), &format!("u{n}"), QueueConfig::default()))
            .collect();

        let report = broadcaster.send_to_all(OutboundMessage::heartbeat());
        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 5);
        for conn in &conns {
            assert!(conn.queue().snapshot()[0].is_heartbeat());
        }

        let again = broadcaster.send_to_all(OutboundMessage::heartbeat());
        assert_eq!(again.outcome(conns[0].id()), Some(DeliveryOutcome::Coalesced));
        assert_eq!(conns[0].queue().len(), 1);
    }

    #[test]
    fn eviction_is_reported() {
        let (registry, broadcaster) = setup();
        let small = QueueConfig {
            capacity: 1,
            eviction_limit: 10,
        };
        let conn = join(&registry, "c1", "u1", small);
        let u1 = RecipientId::from("u1");

        let _ = broadcaster.send_to(&u1, notification("u1"));
        let report = broadcaster.send_to(&u1, notification("u1"));
        assert_eq!(report.evicted, 1);
        assert_eq!(
            report.outcome(conn.id()),
            Some(DeliveryOutcome::DeliveredWithEviction)
        );
    }

    #[test]
    fn overflow_closes_only_the_slow_connection() {
        let (registry, broadcaster) = setup();
        let tight = QueueConfig {
            capacity: 1,
            eviction_limit: 1,
        };
        let slow = join(&registry, "slow", "u1", tight);
        let fast = join(&registry, "fast", "u1", QueueConfig::default());
        let u1 = RecipientId::from("u1");

        let _ = broadcaster.send_to(&u1, notification("u1"));
        let _ = broadcaster.send_to(&u1, notification("u1"));
        let report = broadcaster.send_to(&u1, notification("u1"));

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.outcome(slow.id()), Some(DeliveryOutcome::Overflowed));
        assert_eq!(report.outcome(fast.id()), Some(DeliveryOutcome::Delivered));

        assert_eq!(slow.state(), ConnectionState::Closing);
        assert_eq!(slow.close_reason(), Some(CloseReason::QueueOverflow));
        assert!(registry.get(slow.id()).is_none());
        assert_eq!(fast.queue().len(), 3);
        assert!(registry.is_consistent());
    }

    #[test]
    fn pending_heartbeat_does_not_overflow_single_slot_queue() {
        let (registry, broadcaster) = setup();
        let single = QueueConfig {
            capacity: 1,
            eviction_limit: 100,
        };
        let conn = join(&registry, "c1", "u1", single);

        let _ = broadcaster.send_to_all(OutboundMessage::heartbeat());
        let report = broadcaster.send_to(&RecipientId::from("u1"), notification("u1"));

        assert_eq!(report.outcome(conn.id()), Some(DeliveryOutcome::Delivered));
        assert_eq!(report.dropped, 0);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(registry.get(conn.id()).is_some());
        assert_eq!(
            conn.queue().snapshot()[0].message_type(),
            MessageType::Notification
        );
    }

    #[test]
    fn closed_queue_counts_as_dropped() {
        let (registry, broadcaster) = setup();
        let conn = join(&registry, "c1", "u1", QueueConfig::default());
        let _ = conn.queue().close();

        let report = broadcaster.send_to(&RecipientId::from("u1"), notification("u1"));
        assert_matches!(report.outcome(conn.id()), Some(DeliveryOutcome::Closed));
        assert_eq!(report.dropped, 1);
    }

    #[test]
    fn report_serializes() {
        let (registry, broadcaster) = setup();
        let _ = join(&registry, "c1", "u1", QueueConfig::default());
        let report = broadcaster.send_to(&RecipientId::from("u1"), notification("u1"));
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["attempted"], 1);
        assert_eq!(v["outcomes"]["c1"], "delivered");
    }
}
