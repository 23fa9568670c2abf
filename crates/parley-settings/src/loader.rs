//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment overrides (highest priority)
//! 4. Validate cross-field constraints

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{parley_home, LogFormat, LogLevel, ParleySettings};

/// Resolve the default settings file path (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let mut doc = serde_json::to_value(ParleySettings::default())?;
    if let Some(user) = read_user_file(path)? {
        doc = deep_merge(doc, user);
    }

    let mut settings: ParleySettings = serde_json::from_value(doc)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_user_file(path: &Path) -> Result<Option<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
            return Ok(None);
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_owned(),
                source,
            })
        }
    };
    debug!(?path, "loading settings file");
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key with `source` winning; anything else in `source`
/// replaces `target` outright. `null` in `source` keeps the target value.
pub fn deep_merge(mut target: Value, source: Value) -> Value {
    merge_into(&mut target, source);
    target
}

fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(into), Value::Object(from)) => {
            for (key, value) in from.into_iter().filter(|(_, v)| !v.is_null()) {
                match into.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        let _ = into.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `PARLEY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Each variable has strict parsing rules; invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides<F>(settings: &mut ParleySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = checked(read("PARLEY_PORT"), "PARLEY_PORT", |v| parse_u16_range(v, 0, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = checked(read("PARLEY_MAX_CONNECTIONS"), "PARLEY_MAX_CONNECTIONS", |v| {
        parse_usize_range(v, 1, 1_000_000)
    }) {
        settings.server.max_connections = v;
    }
    if let Some(v) = checked(read("PARLEY_HEARTBEAT_INTERVAL"), "PARLEY_HEARTBEAT_INTERVAL", |v| {
        parse_u64_range(v, 1, 3600)
    }) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = checked(read("PARLEY_HEARTBEAT_TIMEOUT"), "PARLEY_HEARTBEAT_TIMEOUT", |v| {
        parse_u64_range(v, 1, 86_400)
    }) {
        settings.server.heartbeat_timeout_secs = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = checked(read("PARLEY_OUTBOUND_QUEUE"), "PARLEY_OUTBOUND_QUEUE", |v| {
        parse_usize_range(v, 1, 1_000_000)
    }) {
        settings.hub.outbound_queue = v;
    }

    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = read("PARLEY_DB_PATH") {
        settings.database.path = PathBuf::from(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = checked(read("PARLEY_LOG_LEVEL"), "PARLEY_LOG_LEVEL", parse_log_level) {
        settings.logging.level = v;
    }
    if let Some(v) = checked(read("PARLEY_LOG_FORMAT"), "PARLEY_LOG_FORMAT", parse_log_format) {
        settings.logging.format = v;
    }
}

/// Reject combinations no single field can catch.
pub fn validate(settings: &ParleySettings) -> Result<()> {
    let server = &settings.server;
    if server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::invalid(
            "server.heartbeatIntervalSecs",
            "must be positive",
        ));
    }
    if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
        return Err(SettingsError::invalid(
            "server.heartbeatTimeoutSecs",
            format!(
                "{}s is shorter than the {}s heartbeat interval",
                server.heartbeat_timeout_secs, server.heartbeat_interval_secs
            ),
        ));
    }
    if settings.hub.outbound_queue == 0 {
        return Err(SettingsError::invalid("hub.outboundQueue", "must be positive"));
    }
    Ok(())
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

/// Parse a log level name (case-insensitive).
pub fn parse_log_level(val: &str) -> Option<LogLevel> {
    match val.to_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

/// Parse a log format name (case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn checked<T>(raw: Option<String>, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let val = raw?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key, value = %val, "invalid env var, ignoring");
    }
    result
}
