//! # beacon-settings
//!
//! Layered configuration for the Beacon notification server.
//!
//! Settings resolve in three layers, lowest to highest priority:
//! 1. Compiled defaults ([`BeaconSettings::default()`])
//! 2. A JSON file (`~/.beacon/settings.json` unless a path is given)
//! 3. `BEACON_*` environment variables
//!
//! The result is passed explicitly to the server; nothing here is global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    BeaconSettings, ClassificationSettings, LoggingSettings, ServerSettings, StreamSettings,
};
