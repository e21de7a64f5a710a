//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BeaconSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `BEACON_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::BeaconSettings;

/// Resolve the default settings file (`~/.beacon/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BeaconSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BeaconSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
fn load_file_layer(path: &Path) -> Result<BeaconSettings> {
    let defaults = serde_json::to_value(BeaconSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut BeaconSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range; anything else is warned about
/// and ignored, leaving the file/default value in place.
pub fn apply_overrides(settings: &mut BeaconSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("BEACON_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("BEACON_PORT", 0, 65535) {
        settings.server.port = v;
    }

    // ── Stream ──────────────────────────────────────────────────────
    let stream = &mut settings.stream;
    if let Some(v) = env.usize("BEACON_MAX_CONNECTIONS", 1, 100_000) {
        stream.max_connections = v;
    }
    if let Some(v) = env.usize("BEACON_QUEUE_CAPACITY", 1, 100_000) {
        stream.queue_capacity = v;
    }
    if let Some(v) = env.u64("BEACON_EVICTION_LIMIT", 1, 1_000_000) {
        stream.eviction_limit = v;
    }
    if let Some(v) = env.u64("BEACON_IDLE_TIMEOUT_SECS", 1, 86_400) {
        stream.idle_timeout_secs = v;
    }
    if let Some(v) = env.u64("BEACON_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        stream.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.u64("BEACON_WATCHDOG_INTERVAL_SECS", 1, 3_600) {
        stream.watchdog_interval_secs = v;
    }
    if let Some(v) = env.u64("BEACON_SEND_TIMEOUT_SECS", 1, 600) {
        stream.send_timeout_secs = v;
    }
    if let Some(v) = env.u64("BEACON_MAX_LIFETIME_SECS", 1, 604_800) {
        stream.max_lifetime_secs = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("BEACON_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("BEACON_LOG_FORMAT") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(format) => settings.logging.format = format,
            Err(_) => warn!(key = "BEACON_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }

    // ── Classification ──────────────────────────────────────────────
    if let Some(v) = env.string("BEACON_VESSEL_TYPE_MAPPING") {
        settings.classification.vessel_type_mapping_path = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(val.trim());
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use beacon_core::logging::LogFormat;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BeaconSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = BeaconSettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"stream": {"queueCapacity": 50, "maxConnections": 100}});
        let source = serde_json::json!({"stream": {"queueCapacity": 10}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["stream"]["queueCapacity"], 10);
        assert_eq!(merged["stream"]["maxConnections"], 100);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.stream.queue_capacity, 50);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "stream": {"idleTimeoutSecs": 60, "maxLifetimeSecs": 3600}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.stream.idle_timeout_secs, 60);
        assert_eq!(settings.stream.max_lifetime_secs, Some(3600));
        assert_eq!(settings.stream.heartbeat_interval_secs, 30);
    }

    #[test]
    fn load_logging_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"logging": {"format": "json", "level": "debug"}}"#).unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn load_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"stream": {"queueCapacity": "lots"}}"#).unwrap();

        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Schema(_)));
    }

    #[test]
    fn settings_path_under_beacon_dir() {
        let path = settings_path();
        assert!(path.ends_with(".beacon/settings.json"));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("BEACON_HOST", "127.0.0.1"),
            ("BEACON_PORT", "9000"),
            ("BEACON_MAX_CONNECTIONS", "5"),
            ("BEACON_HEARTBEAT_INTERVAL_SECS", "15"),
            ("BEACON_MAX_LIFETIME_SECS", "600"),
            ("BEACON_LOG_FORMAT", "json"),
            ("BEACON_VESSEL_TYPE_MAPPING", "/data/vessel_types.csv"),
        ]);
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.stream.max_connections, 5);
        assert_eq!(s.stream.heartbeat_interval_secs, 15);
        assert_eq!(s.stream.max_lifetime_secs, Some(600));
        assert_eq!(s.logging.format, LogFormat::Json);
        assert_eq!(
            s.classification.vessel_type_mapping_path.as_deref(),
            Some("/data/vessel_types.csv")
        );
    }

    #[test]
    fn invalid_env_values_ignored() {
        let s = overrides(&[
            ("BEACON_MAX_CONNECTIONS", "0"),
            ("BEACON_QUEUE_CAPACITY", "many"),
            ("BEACON_PORT", "70000"),
            ("BEACON_LOG_FORMAT", "xml"),
            ("BEACON_HOST", ""),
        ]);
        let d = BeaconSettings::default();
        assert_eq!(s.stream.max_connections, d.stream.max_connections);
        assert_eq!(s.stream.queue_capacity, d.stream.queue_capacity);
        assert_eq!(s.server.port, d.server.port);
        assert_eq!(s.logging.format, d.logging.format);
        assert_eq!(s.server.host, d.server.host);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("-1", 1, 3600), None);
        assert_eq!(parse_usize_range("100", 1, 100), Some(100));
        assert_eq!(parse_usize_range("101", 1, 100), None);
    }
}
