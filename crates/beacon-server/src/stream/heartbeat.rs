//! Periodic keep-alive fan-out.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::{OutboundMessage, Result, StreamError};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broadcast::{Broadcaster, DeliveryReport};
use crate::metrics::HEARTBEAT_TICKS_TOTAL;

/// Timer that drives `send_to_all(heartbeat)` on a fixed period.
///
/// Holds no per-connection state.
pub struct HeartbeatScheduler {
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
}

impl HeartbeatScheduler {
    /// Create a scheduler. A zero interval is a configuration error.
    pub fn new(broadcaster: Arc<Broadcaster>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(StreamError::InvalidConfig(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        Ok(Self {
            broadcaster,
            interval,
        })
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit one heartbeat to every live connection.
    pub fn tick(&self) -> DeliveryReport {
        counter!(HEARTBEAT_TICKS_TOTAL).increment(1);
        let report = self.broadcaster.send_to_all(OutboundMessage::heartbeat());
        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            "heartbeat tick"
        );
        report
    }

    /// Run until `cancel` fires. The first tick is one interval out.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "heartbeat scheduler started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.tick();
                    }
                }
            }
            info!("heartbeat scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::RecipientId;

    use super::*;
    use crate::stream::connection::Connection;
    use crate::stream::queue::QueueConfig;
    use crate::stream::registry::ConnectionRegistry;

    fn setup(conns: usize) -> (Arc<ConnectionRegistry>, Arc<Broadcaster>, Vec<Arc<Connection>>) {
        let registry = Arc::new(ConnectionRegistry::new(100));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let conns = (0..conns)
            .map(|n| {
                let c = Arc::new(Connection::new(
                    RecipientId::from(format!("u{n}")),
                    QueueConfig::default(),
                ));
                registry.register(Arc::clone(&c)).unwrap();
                c
            })
            .collect();
        (registry, broadcaster, conns)
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (_, broadcaster, _) = setup(0);
        let err = HeartbeatScheduler::new(broadcaster, Duration::ZERO).err().unwrap();
        assert_eq!(err.code(), "invalid_config");
    }

    #[test]
    fn tick_reaches_every_connection() {
        let (_, broadcaster, conns) = setup(3);
        let hb = HeartbeatScheduler::new(broadcaster, Duration::from_secs(30)).unwrap();
        let report = hb.tick();
        assert_eq!(report.attempted, 3);
        for c in &conns {
            assert!(c.queue().snapshot()[0].is_heartbeat());
        }
    }

    #[test]
    fn tick_with_no_connections_is_harmless() {
        let (_, broadcaster, _) = setup(0);
        let hb = HeartbeatScheduler::new(broadcaster, Duration::from_secs(30)).unwrap();
        assert_eq!(hb.tick().attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_scheduler_ticks_each_interval() {
        let (_, broadcaster, conns) = setup(1);
        let hb = HeartbeatScheduler::new(broadcaster, Duration::from_secs(30)).unwrap();
        let cancel = CancellationToken::new();
        let handle = hb.spawn(cancel.clone());
        let queue = conns[0].queue();

        time::sleep(Duration::from_secs(29)).await;
        assert!(queue.is_empty());

        time::sleep(Duration::from_secs(2)).await;
        assert!(queue.try_pop().is_some_and(|m| m.is_heartbeat()));

        time::sleep(Duration::from_secs(30)).await;
        assert!(queue.try_pop().is_some_and(|m| m.is_heartbeat()));

        cancel.cancel();
        handle.await.unwrap();
    }
}
