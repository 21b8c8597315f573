//! Settings loading with deep merge and environment variable overrides.
//!
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `VEPLINE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{LogFormat, Settings};

/// Default settings file location (`~/.vepline/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vepline").join("settings.json")
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load from a specific path. A missing file yields defaults; invalid JSON
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, and nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("VEPLINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("VEPLINE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("VEPLINE_MAX_SEND_QUEUE", 1, 65_536) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = read_env_usize("VEPLINE_MAX_PAYLOAD_BYTES", 1, 512 * 1024 * 1024) {
        settings.pipeline.max_payload_bytes = v;
    }
    if let Some(v) = read_env_usize("VEPLINE_WORKER_CONCURRENCY", 1, 4096) {
        settings.pipeline.worker_concurrency = v;
    }
    if let Some(v) = read_env_usize("VEPLINE_LANE_CAPACITY", 1, 1_000_000) {
        settings.pipeline.lane_capacity = v;
    }
    if let Some(v) = read_env_u64("VEPLINE_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_env_u64("VEPLINE_HEARTBEAT_CEILING_MS", 1_000, 86_400_000) {
        settings.heartbeat.ceiling_ms = v;
    }
    if let Some(v) = read_env_string("VEPLINE_ANNOTATOR_URL") {
        settings.annotator.base_url = v;
    }
    if let Some(v) = read_env_string("VEPLINE_ANNOTATOR_SPECIES") {
        settings.annotator.species = v;
    }
    if let Some(v) = read_env_u32("VEPLINE_MAX_RETRIES", 0, 20) {
        settings.reliability.max_retries = v;
    }
    if let Some(v) = read_env_u64("VEPLINE_CALL_TIMEOUT_MS", 100, 600_000) {
        settings.reliability.call_timeout_ms = v;
    }
    if let Some(v) = read_env_string("VEPLINE_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_string("VEPLINE_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            "json" => settings.telemetry.format = LogFormat::Json,
            "pretty" => settings.telemetry.format = LogFormat::Pretty,
            _ => tracing::warn!(value = %v, "invalid VEPLINE_LOG_FORMAT, ignoring"),
        }
    }
}

/// Cross-field checks that serde cannot express.
pub fn validate(settings: &Settings) -> Result<()> {
    let r = &settings.reliability;
    if r.breaker_window == 0 || r.breaker_window > 32 {
        return Err(SettingsError::InvalidValue(format!(
            "reliability.breakerWindow must be in 1..=32, got {}",
            r.breaker_window
        )));
    }
    if !(r.breaker_failure_ratio > 0.0 && r.breaker_failure_ratio <= 1.0) {
        return Err(SettingsError::InvalidValue(format!(
            "reliability.breakerFailureRatio must be in (0, 1], got {}",
            r.breaker_failure_ratio
        )));
    }
    if settings.heartbeat.interval_ms == 0 {
        return Err(SettingsError::InvalidValue("heartbeat.intervalMs must be > 0".into()));
    }
    if settings.pipeline.worker_concurrency == 0 {
        return Err(SettingsError::InvalidValue(
            "pipeline.workerConcurrency must be > 0".into(),
        ));
    }
    Ok(())
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    read_env_u64(name, u64::from(min), u64::from(max)).and_then(|v| u32::try_from(v).ok())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    read_env_u64(name, u64::from(min), u64::from(max)).and_then(|v| u16::try_from(v).ok())
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    read_env_u64(name, min as u64, max as u64).and_then(|v| usize::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_skips_null_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "list": [1, 2, 3]});
        let source = serde_json::json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.heartbeat.ceiling_ms, 300_000);
        assert_eq!(settings.reliability.max_retries, 3);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"heartbeat": {{"ceilingMs": 900000}}, "annotator": {{"species": "mouse"}}}}"#
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.heartbeat.ceiling_ms, 900_000);
        assert_eq!(settings.heartbeat.interval_ms, 15_000);
        assert_eq!(settings.annotator.species, "mouse");
        assert_eq!(settings.annotator.base_url, "https://rest.ensembl.org");
    }

    #[test]
    fn per_mode_budget_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"reliability": {"perMode": {"lag-probe": {"maxRetries": 0}}}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        let per_mode = &settings.reliability.per_mode;
        assert_eq!(per_mode["lag-probe"].max_retries, Some(0));
        assert_eq!(per_mode["lag-probe"].call_timeout_ms, None);
        assert_eq!(per_mode["cluster-scale"].call_timeout_ms, Some(30_000));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn validate_rejects_oversized_breaker_window() {
        let mut settings = Settings::default();
        settings.reliability.breaker_window = 64;
        assert!(matches!(validate(&settings), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_failure_ratio() {
        let mut settings = Settings::default();
        settings.reliability.breaker_failure_ratio = 0.0;
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_u64_range("15000", 100, 600_000), Some(15_000));
        assert_eq!(parse_u64_range("5", 100, 600_000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
    }
}
