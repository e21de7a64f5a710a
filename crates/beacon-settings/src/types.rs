//! Settings schema with compiled defaults.
//!
//! All structs deserialize with `#[serde(default)]`, so a settings file only
//! needs the keys it overrides.

use std::time::Duration;

use beacon_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Fan-out core settings.
    pub stream: StreamSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
    /// Vessel-type screening settings.
    pub classification: ClassificationSettings,
}

impl BeaconSettings {
    /// Reject values that would make the server unusable.
    ///
    /// Called once at startup; an error here is fatal.
    pub fn validate(&self) -> Result<()> {
        let s = &self.stream;
        let checks: [(&'static str, bool); 7] = [
            ("stream.maxConnections", s.max_connections > 0),
            ("stream.queueCapacity", s.queue_capacity > 0),
            ("stream.evictionLimit", s.eviction_limit > 0),
            ("stream.idleTimeoutSecs", s.idle_timeout_secs > 0),
            ("stream.heartbeatIntervalSecs", s.heartbeat_interval_secs > 0),
            ("stream.watchdogIntervalSecs", s.watchdog_interval_secs > 0),
            ("stream.sendTimeoutSecs", s.send_timeout_secs > 0),
        ];
        if let Some((key, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(SettingsError::invalid(*key, "must be greater than zero"));
        }
        if s.max_lifetime_secs == Some(0) {
            return Err(SettingsError::invalid(
                "stream.maxLifetimeSecs",
                "must be greater than zero when set",
            ));
        }
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::invalid("server.host", "must not be empty"));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Connection, queue, and timer settings for the fan-out core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Global cap on live streaming connections.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity.
    pub queue_capacity: usize,
    /// Evictions tolerated without the consumer draining before the
    /// connection is declared overflowed.
    pub eviction_limit: u64,
    /// Close a session after this long without delivering anything.
    pub idle_timeout_secs: u64,
    /// Heartbeat period, also the session's bounded wait.
    pub heartbeat_interval_secs: u64,
    /// Watchdog scan period.
    pub watchdog_interval_secs: u64,
    /// Upper bound on a single transport write.
    pub send_timeout_secs: u64,
    /// Optional hard cap on connection age.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            queue_capacity: 50,
            eviction_limit: 100,
            idle_timeout_secs: 300,
            heartbeat_interval_secs: 30,
            watchdog_interval_secs: 60,
            send_timeout_secs: 10,
            max_lifetime_secs: None,
        }
    }
}

impl StreamSettings {
    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Watchdog interval as a `Duration`.
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    /// Send timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Maximum connection age, if configured.
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive (e.g. `"info"`); `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Vessel-type screening settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationSettings {
    /// CSV file with `vessel_type` and `vessel_type_level3` columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vessel_type_mapping_path: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
