//! Recipient-indexed registry of live connections.
//!
//! Two `DashMap` indexes: connection ID → connection, and recipient →
//! connection IDs. Mutations are serialized by a small mutex so both indexes
//! move together; lookups only touch the sharded maps and never wait on
//! unrelated recipients. A connection is present iff it is `active`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use beacon_core::{ConnectionId, RecipientId, Result, StreamError};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::connection::{CloseReason, Connection};
use crate::metrics::record_active_connections;

/// Live connection registry with a global cap.
pub struct ConnectionRegistry {
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    by_recipient: DashMap<RecipientId, HashSet<ConnectionId>>,
    /// Registered connections plus outstanding reservations.
    slots: AtomicUsize,
    max_connections: usize,
    mutations: Mutex<()>,
}

/// A capacity slot held between the cap check and registration.
///
/// Dropping it without [`commit`](Self::commit) releases the slot.
pub struct Reservation<'a> {
    registry: &'a ConnectionRegistry,
    committed: bool,
}

impl Reservation<'_> {
    /// Activate `connection` and make it visible to broadcasts.
    ///
    /// Fails with [`StreamError::ConnectionClosed`] if the connection is no
    /// longer `connecting`; the slot is released in that case.
    pub fn commit(mut self, connection: Arc<Connection>) -> Result<()> {
        if !connection.activate() {
            return Err(StreamError::ConnectionClosed {
                connection_id: connection.id().clone(),
            });
        }
        self.registry.insert(connection);
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.registry.slots.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl ConnectionRegistry {
    /// Create an empty registry admitting at most `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            by_id: DashMap::new(),
            by_recipient: DashMap::new(),
            slots: AtomicUsize::new(0),
            max_connections,
            mutations: Mutex::new(()),
        }
    }

    /// Configured cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Claim a slot under the cap before any connection state is built.
    pub fn try_reserve(&self) -> Result<Reservation<'_>> {
        let max = self.max_connections;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| StreamError::CapacityExceeded { max })?;
        Ok(Reservation {
            registry: self,
            committed: false,
        })
    }

    /// Reserve and commit in one step.
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        self.try_reserve()?.commit(connection)
    }

    fn insert(&self, connection: Arc<Connection>) {
        let id = connection.id().clone();
        let recipient = connection.recipient().clone();
        {
            let _guard = self.mutations.lock();
            let _ = self.by_id.insert(id.clone(), connection);
            let _ = self
                .by_recipient
                .entry(recipient.clone())
                .or_default()
                .insert(id.clone());
        }
        record_active_connections(self.len());
        debug!(conn_id = %id, %recipient, "connection registered");
    }

    /// Remove a connection, close it, and discard its queue.
    ///
    /// Idempotent: returns `None` if the ID is not registered.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let connection = {
            let _guard = self.mutations.lock();
            let (_, connection) = self.by_id.remove(id)?;
            let recipient = connection.recipient();
            let now_empty = self.by_recipient.get_mut(recipient).is_some_and(|mut ids| {
                let _ = ids.remove(id);
                ids.is_empty()
            });
            if now_empty {
                let _ = self.by_recipient.remove_if(recipient, |_, ids| ids.is_empty());
            }
            connection
        };
        let _ = self.slots.fetch_sub(1, Ordering::AcqRel);

        let _ = connection.request_close(CloseReason::Deregistered);
        let _ = connection.queue().close();
        record_active_connections(self.len());
        debug!(conn_id = %id, recipient = %connection.recipient(), "connection deregistered");
        Some(connection)
    }

    /// Snapshot of the connections registered for `recipient`.
    pub fn lookup(&self, recipient: &RecipientId) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.by_recipient.get(recipient) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|c| Arc::clone(c.value())))
            .collect()
    }

    /// Snapshot of every registered connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_id.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Look up one connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of distinct recipients with at least one connection.
    pub fn recipient_count(&self) -> usize {
        self.by_recipient.len()
    }

    /// Whether both indexes agree.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let _guard = self.mutations.lock();
        let forward = self.by_recipient.iter().all(|entry| {
            !entry.value().is_empty()
                && entry.value().iter().all(|id| {
                    self.by_id
                        .get(id)
                        .is_some_and(|c| c.recipient() == entry.key())
                })
        });
        let backward = self.by_id.iter().all(|entry| {
            self.by_recipient
                .get(entry.value().recipient())
                .is_some_and(|ids| ids.contains(entry.key()))
        });
        forward && backward && self.slots.load(Ordering::Acquire) == self.by_id.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::stream::connection::ConnectionState;
    use crate::stream::queue::QueueConfig;

    fn conn(id: &str, recipient: &str) -> Arc<Connection> {
        Arc::new(Connection::with_id(
            ConnectionId::from(id),
            RecipientId::from(recipient),
            QueueConfig::default(),
        ))
    }

    #[test]
    fn register_makes_connection_visible() {
        let reg = ConnectionRegistry::new(10);
        let c1 = conn("c1", "u1");
        reg.register(Arc::clone(&c1)).unwrap();

        assert_eq!(c1.state(), ConnectionState::Active);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(&RecipientId::from("u1")).len(), 1);
        assert!(reg.lookup(&RecipientId::from("u2")).is_empty());
        assert!(reg.is_consistent());
    }

    #[test]
    fn shared_recipient_indexes_both() {
        let reg = ConnectionRegistry::new(10);
        reg.register(conn("c1", "u1")).unwrap();
        reg.register(conn("c2", "u1")).unwrap();
        reg.register(conn("c3", "u2")).unwrap();

        let mut ids: Vec<String> = reg
            .lookup(&RecipientId::from("u1"))
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, ["c1", "c2"]);
        assert_eq!(reg.recipient_count(), 2);
        assert_eq!(reg.all().len(), 3);
    }

    #[test]
    fn cap_of_one_frees_on_deregister() {
        let reg = ConnectionRegistry::new(1);
        reg.register(conn("c1", "u1")).unwrap();
        assert_matches!(
            reg.register(conn("c2", "u2")),
            Err(StreamError::CapacityExceeded { max: 1 })
        );
        assert!(reg.deregister(&ConnectionId::from("c1")).is_some());
        reg.register(conn("c2", "u2")).unwrap();
        assert!(reg.is_consistent());
    }

    #[test]
    fn cap_of_one_hundred() {
        let reg = ConnectionRegistry::new(100);
        for n in 0..100 {
            reg.register(conn(&format!("c{n}"), "u")).unwrap();
        }
        assert_matches!(
            reg.register(conn("c100", "u")),
            Err(StreamError::CapacityExceeded { max: 100 })
        );
        let _ = reg.deregister(&ConnectionId::from("c42"));
        reg.register(conn("c100", "u")).unwrap();
        assert_eq!(reg.len(), 100);
    }

    #[test]
    fn rejected_connection_is_never_activated() {
        let reg = ConnectionRegistry::new(0);
        let c = conn("c1", "u1");
        assert!(reg.register(Arc::clone(&c)).is_err());
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(reg.is_empty());
    }

    #[test]
    fn dropped_reservation_releases_slot() {
        let reg = ConnectionRegistry::new(1);
        {
            let _held = reg.try_reserve().unwrap();
            assert!(reg.try_reserve().is_err());
        }
        assert!(reg.try_reserve().is_ok());
    }

    #[test]
    fn commit_of_closed_connection_fails_and_releases() {
        let reg = ConnectionRegistry::new(1);
        let c = conn("c1", "u1");
        let _ = c.request_close(CloseReason::Shutdown);
        let reservation = reg.try_reserve().unwrap();
        assert_matches!(
            reservation.commit(c),
            Err(StreamError::ConnectionClosed { .. })
        );
        assert!(reg.try_reserve().is_ok());
    }

    #[test]
    fn deregister_is_idempotent_and_closes() {
        let reg = ConnectionRegistry::new(10);
        let c = conn("c1", "u1");
        reg.register(Arc::clone(&c)).unwrap();

        assert!(reg.deregister(c.id()).is_some());
        assert!(reg.deregister(c.id()).is_none());
        assert_eq!(c.state(), ConnectionState::Closing);
        assert_eq!(c.close_reason(), Some(CloseReason::Deregistered));
        assert!(c.queue().is_closed());
        assert_eq!(reg.recipient_count(), 0);
        assert!(reg.is_consistent());
    }

    #[tokio::test]
    async fn concurrent_registration_respects_cap() {
        let reg = Arc::new(ConnectionRegistry::new(25));
        let mut handles = Vec::new();
        for n in 0..100 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.register(conn(&format!("c{n}"), &format!("u{}", n % 7))).is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
        assert_eq!(reg.len(), 25);
        assert!(reg.is_consistent());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Register { id: u8, recipient: u8 },
        Deregister { id: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, 0u8..4).prop_map(|(id, recipient)| Op::Register { id, recipient }),
            (0u8..16).prop_map(|id| Op::Deregister { id }),
        ]
    }

    proptest! {
        #[test]
        fn indexes_stay_consistent(ops in proptest::collection::vec(op(), 0..64)) {
            let reg = ConnectionRegistry::new(8);
            for op in ops {
                match op {
                    Op::Register { id, recipient } => {
                        let id = ConnectionId::from(format!("c{id}"));
                        if reg.get(&id).is_none() {
                            let _ = reg.register(Arc::new(Connection::with_id(
                                id,
                                RecipientId::from(format!("u{recipient}")),
                                QueueConfig::default(),
                            )));
                        }
                    }
                    Op::Deregister { id } => {
                        let _ = reg.deregister(&ConnectionId::from(format!("c{id}")));
                    }
                }
                prop_assert!(reg.is_consistent());
                prop_assert!(reg.len() <= 8);
            }
        }
    }
}
