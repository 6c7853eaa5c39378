//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If a settings file exists, deep-merge its values over defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{SlowConsumerPolicy, TetherSettings, TransportMode};

/// Env var naming the settings file to load.
pub const SETTINGS_PATH_ENV: &str = "TETHER_SETTINGS";

/// Load settings from `$TETHER_SETTINGS` (when set) with env var overrides.
///
/// Without a settings file the result is compiled defaults plus overrides.
pub fn load_settings() -> Result<TetherSettings> {
    match std::env::var(SETTINGS_PATH_ENV).ok().filter(|p| !p.is_empty()) {
        Some(path) => load_settings_from_path(Path::new(&path)),
        None => {
            let mut settings = TetherSettings::default();
            apply_env_overrides(&mut settings);
            validate(&settings)?;
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (falling back to file/default).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// `lookup` returns the raw value for a variable name, or `None` when unset.
pub fn apply_overrides<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = read("TETHER_TRANSPORT") {
        match v.parse::<TransportMode>() {
            Ok(mode) => settings.transport.mode = mode,
            Err(e) => warn!(key = "TETHER_TRANSPORT", value = %v, error = %e, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("TETHER_ADDRESS") {
        settings.transport.address = v;
    }
    if let Some(v) = read("TETHER_PORT") {
        match parse_u16_range(&v, 0, u16::MAX) {
            Some(port) => settings.transport.port = port,
            None => warn!(key = "TETHER_PORT", value = %v, "invalid u16 env var, ignoring"),
        }
    }
    if let Some(v) = read("TETHER_SECRET") {
        settings.transport.secret = Some(v);
    }
    if let Some(v) = read("TETHER_ALLOWED_ORIGINS") {
        settings.transport.allowed_origins = parse_list(&v);
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_MAILBOX_CAPACITY") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => settings.hub.mailbox_capacity = n,
            None => warn!(key = "TETHER_MAILBOX_CAPACITY", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("TETHER_SLOW_CONSUMER") {
        match v.parse::<SlowConsumerPolicy>() {
            Ok(policy) => settings.hub.slow_consumer = policy,
            Err(e) => warn!(key = "TETHER_SLOW_CONSUMER", value = %v, error = %e, "invalid env var, ignoring"),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_LOG") {
        settings.logging.level = v;
    }
}

/// Reject settings no transport could run with.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    if settings.hub.mailbox_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "hub.mailboxCapacity must be > 0".into(),
        ));
    }
    if settings.transport.heartbeat_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "transport.heartbeatIntervalSecs must be > 0".into(),
        ));
    }
    if settings.transport.address.trim().is_empty() {
        return Err(SettingsError::InvalidValue(
            "transport.address must not be empty".into(),
        ));
    }
    if settings.transport.secret.as_deref().is_some_and(str::is_empty) {
        return Err(SettingsError::InvalidValue(
            "transport.secret must not be empty when set".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
