//! Notification fan-out core.
//!
//! - [`registry`]: recipient-indexed live connections with a global cap
//! - [`queue`]: bounded per-connection backlog, drop-oldest with heartbeat priority
//! - [`broadcast`]: `send_to` / `send_to_all` with per-connection delivery reports
//! - [`heartbeat`]: periodic keep-alive fan-out
//! - [`session`]: per-connection control loop over a [`transport::Transport`]
//! - [`lifecycle`]: admission, watchdog reaping, bulk teardown

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod session;
pub mod transport;

pub use broadcast::{Broadcaster, DeliveryOutcome, DeliveryReport};
pub use connection::{CloseReason, Connection, ConnectionState};
pub use heartbeat::HeartbeatScheduler;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use queue::{Enqueued, OutboundQueue, QueueConfig, QueueRejected};
pub use registry::{ConnectionRegistry, Reservation};
pub use session::{SessionConfig, StreamSession};
pub use transport::{SseStream, SseTransport, Transport, TransportError};
