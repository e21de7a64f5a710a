//! Per-connection control loop.
//!
//! A session owns the transport for one active connection. It writes the
//! `connection_established` greeting, then repeatedly waits (bounded by the
//! heartbeat interval and the remaining idle budget) for either a queued
//! message, a close request, or the client going away. Any exit path runs
//! the same teardown: deregister, discard the backlog, drop the transport,
//! mark the connection `closed`.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::{OutboundMessage, StreamError};
use metrics::counter;
use tracing::{debug, info, warn};

use super::connection::{CloseReason, Connection};
use super::registry::ConnectionRegistry;
use super::transport::{Transport, TransportError};
use crate::metrics::STREAM_DISCONNECTIONS_TOTAL;

/// Session timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on one wait for the next queued message.
    pub poll_interval: Duration,
    /// Close after this long without a successful write.
    pub idle_timeout: Duration,
    /// Upper bound on a single transport write.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            send_timeout: Duration::from_secs(10),
        }
    }
}

fn close_reason(err: &StreamError) -> CloseReason {
    CloseReason::for_error(err).unwrap_or(CloseReason::TransportFailure)
}

enum Step {
    Deliver(Arc<OutboundMessage>),
    Wait,
    Stop(CloseReason),
}

/// The control loop for one streaming connection.
pub struct StreamSession<T> {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    transport: T,
    config: SessionConfig,
}

impl<T: Transport> StreamSession<T> {
    /// Bind an already registered connection to its transport.
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        transport: T,
        config: SessionConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            transport,
            config,
        }
    }

    /// Drive the session to completion and return why it closed.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.drive().await;
        self.teardown(reason)
    }

    async fn drive(&mut self) -> CloseReason {
        let conn = Arc::clone(&self.connection);
        let greeting = OutboundMessage::connection_established(conn.recipient().clone());
        if let Err(reason) = self.write(&greeting).await {
            return reason;
        }
        debug!(conn_id = %conn.id(), recipient = %conn.recipient(), "stream session active");

        loop {
            let idle = conn.idle_for();
            if idle >= self.config.idle_timeout {
                let err = StreamError::IdleTimeout {
                    connection_id: conn.id().clone(),
                    idle,
                };
                info!(error = %err, code = err.code(), "closing idle stream session");
                return close_reason(&err);
            }
            let wait = self.config.poll_interval.min(self.config.idle_timeout - idle);

            let step = tokio::select! {
                biased;
                () = conn.close_requested() => {
                    Step::Stop(conn.close_reason().unwrap_or(CloseReason::Deregistered))
                }
                () = self.transport.closed() => Step::Stop(CloseReason::ClientDisconnect),
                next = conn.queue().pop(wait) => next.map_or(Step::Wait, Step::Deliver),
            };

            match step {
                Step::Deliver(message) => {
                    if let Err(reason) = self.write(&message).await {
                        return reason;
                    }
                }
                Step::Wait => {}
                Step::Stop(reason) => return reason,
            }
        }
    }

    async fn write(&mut self, message: &OutboundMessage) -> Result<(), CloseReason> {
        let conn = &self.connection;
        match tokio::time::timeout(self.config.send_timeout, self.transport.send(message)).await {
            Ok(Ok(())) => {
                conn.touch();
                Ok(())
            }
            Ok(Err(TransportError::Disconnected)) => Err(CloseReason::ClientDisconnect),
            Ok(Err(e)) => {
                let err = StreamError::TransportFailure {
                    connection_id: conn.id().clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, code = err.code(), "transport write failed");
                Err(close_reason(&err))
            }
            Err(_) => {
                let err = StreamError::TransportFailure {
                    connection_id: conn.id().clone(),
                    reason: format!(
                        "write timed out after {}s",
                        self.config.send_timeout.as_secs()
                    ),
                };
                warn!(error = %err, code = err.code(), "transport write timed out");
                Err(close_reason(&err))
            }
        }
    }

    fn teardown(self, reason: CloseReason) -> CloseReason {
        let conn = self.connection;
        let _ = conn.request_close(reason);
        let reason = conn.close_reason().unwrap_or(reason);
        let discarded = conn.queue().close();
        let _ = self.registry.deregister(conn.id());
        drop(self.transport);
        conn.mark_closed();

        counter!(STREAM_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(
            conn_id = %conn.id(),
            recipient = %conn.recipient(),
            %reason,
            discarded,
            lifetime_secs = conn.age().as_secs(),
            "stream session closed"
        );
        reason
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use beacon_core::{MessageType, RecipientId};
    use serde_json::json;
    use tokio::sync::{mpsc, watch};
    use tokio::time::{self, Instant};

    use super::*;
    use crate::stream::broadcast::Broadcaster;
    use crate::stream::connection::ConnectionState;
    use crate::stream::queue::QueueConfig;

    /// Records frames; can be told to stall or to report the client gone.
    struct RecordingTransport {
        sent: mpsc::UnboundedSender<OutboundMessage>,
        gone: watch::Receiver<bool>,
        stall: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if *self.gone.borrow() {
                return Err(TransportError::Disconnected);
            }
            self.sent
                .send(message.clone())
                .map_err(|_| TransportError::Disconnected)
        }

        async fn closed(&self) {
            let mut gone = self.gone.clone();
            while !*gone.borrow_and_update() {
                if gone.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        broadcaster: Broadcaster,
        conn: Arc<Connection>,
        frames: mpsc::UnboundedReceiver<OutboundMessage>,
        gone: watch::Sender<bool>,
        session: Option<StreamSession<RecordingTransport>>,
    }

    fn harness(config: SessionConfig, stall: bool) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(10));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let conn = Arc::new(Connection::new(RecipientId::from("u1"), QueueConfig::default()));
        registry.register(Arc::clone(&conn)).unwrap();

        let (sent, frames) = mpsc::unbounded_channel();
        let (gone, gone_rx) = watch::channel(false);
        let transport = RecordingTransport {
            sent,
            gone: gone_rx,
            stall,
        };
        let session = StreamSession::new(Arc::clone(&conn), Arc::clone(&registry), transport, config);
        Harness {
            registry,
            broadcaster,
            conn,
            frames,
            gone,
            session: Some(session),
        }
    }

    fn spawn(h: &mut Harness) -> tokio::task::JoinHandle<CloseReason> {
        let session = h.session.take().unwrap();
        tokio::spawn(session.run())
    }

    #[tokio::test(start_paused = true)]
    async fn greets_then_delivers_in_order() {
        let mut h = harness(SessionConfig::default(), false);
        let handle = spawn(&mut h);

        let first = h.frames.recv().await.unwrap();
        assert_eq!(first.message_type(), MessageType::ConnectionEstablished);

        let u1 = RecipientId::from("u1");
        for n in 0..3 {
            let _ = h
                .broadcaster
                .send_to(&u1, OutboundMessage::notification(u1.clone(), json!({ "n": n })));
        }
        for n in 0..3 {
            match h.frames.recv().await.unwrap() {
                OutboundMessage::Notification { data, .. } => assert_eq!(data["n"], n),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        let _ = h.registry.deregister(h.conn.id());
        assert_eq!(handle.await.unwrap(), CloseReason::Deregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closes_itself() {
        let config = SessionConfig {
            poll_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            send_timeout: Duration::from_secs(10),
        };
        let mut h = harness(config, false);
        let started = Instant::now();
        let handle = spawn(&mut h);

        assert_eq!(handle.await.unwrap(), CloseReason::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert!(h.registry.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_a_session_alive() {
        let mut h = harness(SessionConfig::default(), false);
        let handle = spawn(&mut h);
        let _ = h.frames.recv().await.unwrap();

        for _ in 0..20 {
            time::sleep(Duration::from_secs(30)).await;
            let _ = h.broadcaster.send_to_all(OutboundMessage::heartbeat());
            assert!(h.frames.recv().await.unwrap().is_heartbeat());
        }
        assert_eq!(h.conn.state(), ConnectionState::Active);

        let _ = h.conn.request_close(CloseReason::Shutdown);
        assert_eq!(handle.await.unwrap(), CloseReason::Shutdown);
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_tears_down() {
        let mut h = harness(SessionConfig::default(), false);
        let handle = spawn(&mut h);
        let _ = h.frames.recv().await.unwrap();

        h.gone.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::ClientDisconnect);
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert!(h.registry.get(h.conn.id()).is_none());
        assert!(h.conn.queue().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_is_a_transport_failure() {
        let mut h = harness(SessionConfig::default(), true);
        let handle = spawn(&mut h);
        assert_eq!(handle.await.unwrap(), CloseReason::TransportFailure);
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_reason_is_preserved() {
        let mut h = harness(SessionConfig::default(), false);
        let handle = spawn(&mut h);
        let _ = h.frames.recv().await.unwrap();

        let _ = h.conn.request_close(CloseReason::QueueOverflow);
        let _ = h.registry.deregister(h.conn.id());
        assert_eq!(handle.await.unwrap(), CloseReason::QueueOverflow);
    }
}
