//! Runtime server configuration.
//!
//! Built once from [`BeaconSettings`] at startup; durations and sub-configs
//! are resolved here so the stream core never sees raw settings.

use std::time::Duration;

use beacon_settings::BeaconSettings;

use crate::stream::{LifecycleConfig, QueueConfig, SessionConfig};

/// SSE body channel depth between a session and the HTTP response.
pub const DEFAULT_SSE_BUFFER: usize = 16;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to (0 = auto-assign).
    pub port: u16,
    /// Global cap on live stream connections.
    pub max_connections: usize,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Session timing.
    pub session: SessionConfig,
    /// Admission and watchdog limits.
    pub lifecycle: LifecycleConfig,
    /// SSE body channel depth.
    pub sse_buffer: usize,
}

impl From<&BeaconSettings> for ServerConfig {
    fn from(settings: &BeaconSettings) -> Self {
        let stream = &settings.stream;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: stream.max_connections,
            heartbeat_interval: stream.heartbeat_interval(),
            session: SessionConfig {
                poll_interval: stream.heartbeat_interval(),
                idle_timeout: stream.idle_timeout(),
                send_timeout: stream.send_timeout(),
            },
            lifecycle: LifecycleConfig {
                queue: QueueConfig {
                    capacity: stream.queue_capacity,
                    eviction_limit: stream.eviction_limit,
                },
                idle_timeout: stream.idle_timeout(),
                max_lifetime: stream.max_lifetime(),
                watchdog_interval: stream.watchdog_interval(),
            },
            sse_buffer: DEFAULT_SSE_BUFFER,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from(&BeaconSettings::default())
        }
    }
}
