//! # beacon-core
//!
//! Foundation types shared by every Beacon crate:
//!
//! - **Branded IDs**: `ConnectionId`, `NotificationId`, `RecipientId` newtypes
//! - **Messages**: `OutboundMessage` with its JSON wire shape
//! - **Errors**: `StreamError` taxonomy via `thiserror`
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;

pub use errors::{Result, StreamError};
pub use ids::{ConnectionId, NotificationId, RecipientId};
pub use messages::{MessageType, OutboundMessage};
