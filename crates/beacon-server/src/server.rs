//! `BeaconServer`: Axum HTTP + SSE server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use beacon_core::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::classification::VesselTypeIndex;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::http::{self, stream, webhook};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::stream::{
    Broadcaster, CloseReason, ConnectionRegistry, HeartbeatScheduler, LifecycleManager,
    SessionConfig,
};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Fan-out entry point for webhook events.
    pub broadcaster: Arc<Broadcaster>,
    /// Admission and teardown.
    pub lifecycle: Arc<LifecycleManager>,
    /// Vessel-type screening table, when loaded.
    pub classifier: Option<Arc<VesselTypeIndex>>,
    /// Prometheus handle for `/metrics`, when installed.
    pub metrics: Option<PrometheusHandle>,
    /// Shutdown coordinator (tracks session tasks).
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Session timing.
    pub session: SessionConfig,
    /// SSE body channel depth.
    pub sse_buffer: usize,
    /// When the server started.
    pub start_time: Instant,
}

/// The notification server.
pub struct BeaconServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    lifecycle: Arc<LifecycleManager>,
    classifier: Option<Arc<VesselTypeIndex>>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl BeaconServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            config.lifecycle,
        ));
        Self {
            config,
            registry,
            broadcaster,
            lifecycle,
            classifier: None,
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Enable vessel-type screening.
    #[must_use]
    pub fn with_classifier(mut self, index: VesselTypeIndex) -> Self {
        self.classifier = Some(Arc::new(index));
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broadcaster: Arc::clone(&self.broadcaster),
            lifecycle: Arc::clone(&self.lifecycle),
            classifier: self.classifier.clone(),
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
            session: self.config.session,
            sse_buffer: self.config.sse_buffer,
            start_time: self.start_time,
        };

        Router::new()
            .route("/", get(http::root_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/notifications/stream", get(stream::stream_handler))
            .route(
                "/notifications/webhook/zone-port-event",
                post(webhook::zone_port_event),
            )
            .route(
                "/notifications/webhook/vessel-event",
                post(webhook::vessel_event),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start the heartbeat scheduler and the watchdog.
    ///
    /// Fails only on unusable timer configuration.
    pub fn spawn_background(&self) -> Result<Vec<JoinHandle<()>>> {
        let heartbeat =
            HeartbeatScheduler::new(Arc::clone(&self.broadcaster), self.config.heartbeat_interval)?;
        let watchdog = self.lifecycle.spawn_watchdog(self.shutdown.token())?;
        Ok(vec![heartbeat.spawn(self.shutdown.token()), watchdog])
    }

    /// Bind and serve until shutdown is requested.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server error");
            }
        });
        info!(%addr, "beacon server listening");
        Ok((addr, handle))
    }

    /// Stop accepting, close every stream, and wait for tasks to drain.
    pub async fn shutdown_gracefully(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        self.shutdown.shutdown();
        let _ = self.lifecycle.close_all(CloseReason::Shutdown);
        self.shutdown.graceful_shutdown(handles, timeout).await;
        info!("beacon server stopped");
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The lifecycle manager.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.lifecycle.registry();
    Json(health::health_check(
        state.start_time,
        registry.len(),
        registry.recipient_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
