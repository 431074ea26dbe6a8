//! Conversions between domain values and SQLite values

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use vulnsync_core::{Error, Result};

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("Invalid stored timestamp {:?}: {}", raw, e)))
}

pub fn ts(ts: &DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_ts(ts))
}

pub fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

pub fn opt_text(value: &Option<String>) -> SqlValue {
    match value {
        Some(v) => SqlValue::Text(v.clone()),
        None => SqlValue::Null,
    }
}

pub fn opt_real(value: Option<f64>) -> SqlValue {
    match value {
        Some(v) => SqlValue::Real(v),
        None => SqlValue::Null,
    }
}

/// Serialize a JSON column; `null` is stored as SQL NULL
pub fn json(value: &Value) -> SqlValue {
    if value.is_null() {
        SqlValue::Null
    } else {
        SqlValue::Text(value.to_string())
    }
}

pub fn opt_json(value: &Option<Value>) -> SqlValue {
    match value {
        Some(v) => json(v),
        None => SqlValue::Null,
    }
}

/// Parse a stored JSON column back into a value
pub fn parse_json(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}
