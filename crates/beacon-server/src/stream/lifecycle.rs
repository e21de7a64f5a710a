//! Admission, watchdog reaping, and bulk teardown.
//!
//! The capacity check happens before any connection state is allocated, so
//! a rejected client never enters the registry. The watchdog is the backstop
//! for sessions whose own loop stalled: it scans `last_activity` on a fixed
//! period and force-closes anything past the idle window (or past the
//! optional maximum age).

use std::sync::Arc;
use std::time::Duration;

use beacon_core::{ConnectionId, RecipientId, Result, StreamError};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{CloseReason, Connection};
use super::queue::QueueConfig;
use super::registry::ConnectionRegistry;
use crate::metrics::{STREAM_CONNECTIONS_TOTAL, STREAM_REJECTIONS_TOTAL, WATCHDOG_REAPED_TOTAL};

/// Lifecycle limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Queue sizing for admitted connections.
    pub queue: QueueConfig,
    /// Reap connections idle at least this long.
    pub idle_timeout: Duration,
    /// Reap connections older than this, if set.
    pub max_lifetime: Option<Duration>,
    /// Watchdog scan period.
    pub watchdog_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: None,
            watchdog_interval: Duration::from_secs(60),
        }
    }
}

/// Enforces cross-session invariants over the registry.
pub struct LifecycleManager {
    registry: Arc<ConnectionRegistry>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    /// Create a manager over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, config: LifecycleConfig) -> Self {
        Self { registry, config }
    }

    /// The managed registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Admit a new connection for `recipient`.
    ///
    /// On success the connection is `active` and visible to broadcasts. On
    /// [`StreamError::CapacityExceeded`] nothing was allocated.
    pub fn admit(&self, recipient: RecipientId) -> Result<Arc<Connection>> {
        let reservation = match self.registry.try_reserve() {
            Ok(r) => r,
            Err(e) => {
                counter!(STREAM_REJECTIONS_TOTAL).increment(1);
                warn!(%recipient, max = self.registry.max_connections(), "rejecting stream connection: at capacity");
                return Err(e);
            }
        };
        let connection = Arc::new(Connection::new(recipient, self.config.queue));
        reservation.commit(Arc::clone(&connection))?;

        counter!(STREAM_CONNECTIONS_TOTAL).increment(1);
        info!(
            conn_id = %connection.id(),
            recipient = %connection.recipient(),
            active = self.registry.len(),
            "stream connection admitted"
        );
        Ok(connection)
    }

    fn stale_reason(&self, connection: &Connection) -> Option<CloseReason> {
        if connection.idle_for() >= self.config.idle_timeout {
            return Some(CloseReason::IdleTimeout);
        }
        self.config
            .max_lifetime
            .filter(|max| connection.age() >= *max)
            .map(|_| CloseReason::LifetimeExceeded)
    }

    /// One watchdog pass. Returns the IDs it closed.
    pub fn reap_stale(&self) -> Vec<ConnectionId> {
        let mut reaped = Vec::new();
        for connection in self.registry.all() {
            let Some(reason) = self.stale_reason(&connection) else {
                continue;
            };
            let _ = connection.request_close(reason);
            if self.registry.deregister(connection.id()).is_some() {
                warn!(
                    conn_id = %connection.id(),
                    recipient = %connection.recipient(),
                    %reason,
                    idle_secs = connection.idle_for().as_secs(),
                    "watchdog reaped stale connection"
                );
                reaped.push(connection.id().clone());
            }
        }
        if !reaped.is_empty() {
            counter!(WATCHDOG_REAPED_TOTAL).increment(reaped.len() as u64);
        }
        reaped
    }

    /// Run the watchdog until `cancel` fires.
    pub fn spawn_watchdog(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let period = self.config.watchdog_interval;
        if period.is_zero() {
            return Err(StreamError::InvalidConfig(
                "watchdog interval must be greater than zero".into(),
            ));
        }
        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = manager.reap_stale();
                        debug!(reaped = reaped.len(), active = manager.registry.len(), "watchdog pass");
                    }
                }
            }
            debug!("watchdog stopped");
        }))
    }

    /// Close every registered connection with `reason`.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for connection in self.registry.all() {
            let _ = connection.request_close(reason);
            if self.registry.deregister(connection.id()).is_some() {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, %reason, "closed all stream connections");
        }
        closed
    }
}
