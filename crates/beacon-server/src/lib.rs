//! # beacon-server
//!
//! Axum HTTP + SSE server and recipient-addressed notification fan-out.
//!
//! - SSE endpoint: admission against a global cap, one session task per stream
//! - Webhook ingestion: zone/port and vessel events routed to one recipient
//! - Per-connection bounded queues with drop-oldest and heartbeat priority
//! - Heartbeat scheduler and idle watchdog
//! - Graceful shutdown via `CancellationToken` + `TaskTracker`

#![deny(unsafe_code)]

pub mod classification;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use config::ServerConfig;
pub use server::{AppState, BeaconServer};
