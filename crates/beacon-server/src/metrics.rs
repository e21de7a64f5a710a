//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics::gauge;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Publish the current number of registered connections.
#[allow(clippy::cast_precision_loss)]
pub fn record_active_connections(count: usize) {
    gauge!(STREAM_CONNECTIONS_ACTIVE).set(count as f64);
}

// Metric name constants to avoid typos across modules.

/// Stream connections admitted (counter).
pub const STREAM_CONNECTIONS_TOTAL: &str = "stream_connections_total";
/// Stream connections rejected at capacity (counter).
pub const STREAM_REJECTIONS_TOTAL: &str = "stream_rejections_total";
/// Stream sessions closed (counter, labels: reason).
pub const STREAM_DISCONNECTIONS_TOTAL: &str = "stream_disconnections_total";
/// Registered stream connections (gauge).
pub const STREAM_CONNECTIONS_ACTIVE: &str = "stream_connections_active";
/// Broadcast calls (counter, labels: type).
pub const BROADCAST_MESSAGES_TOTAL: &str = "broadcast_messages_total";
/// Notifications evicted from full queues (counter).
pub const BROADCAST_EVICTIONS_TOTAL: &str = "broadcast_evictions_total";
/// Pushes refused by overflowing queues (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
/// Heartbeat scheduler ticks (counter).
pub const HEARTBEAT_TICKS_TOTAL: &str = "heartbeat_ticks_total";
/// Connections force-closed by the watchdog (counter).
pub const WATCHDOG_REAPED_TOTAL: &str = "watchdog_reaped_total";
/// Webhook events accepted (counter, labels: source).
pub const WEBHOOK_EVENTS_TOTAL: &str = "webhook_events_total";
