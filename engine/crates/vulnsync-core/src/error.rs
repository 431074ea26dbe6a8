//! Error types for vulnsync

use thiserror::Error;

/// Result type alias using the vulnsync Error
pub type Result<T> = std::result::Result<T, Error>;

/// vulnsync error types
#[derive(Error, Debug)]
pub enum Error {
    // === Fetch Errors ===
    #[error("Fetch failed for {url} (last status: {last_status:?}): {message}")]
    Fetch {
        url: String,
        last_status: Option<u16>,
        message: String,
    },

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // === Parse Errors ===
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid record {record_id}: {message}")]
    InvalidRecord { record_id: String, message: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // === Persistence Errors ===
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database busy: {0}")]
    DatabaseBusy(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a fetch error for `url`
    pub fn fetch(
        url: impl Into<String>,
        last_status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Error::Fetch {
            url: url.into(),
            last_status,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Fetch failures are retryable when no response arrived at all or the
    /// status is 408, 429 or 5xx. A busy database is worth another try; a
    /// timeout already spent its deadline and is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch { last_status, .. } => match last_status {
                None => true,
                Some(status) => is_transient_status(*status),
            },
            Error::DatabaseBusy(_) => true,
            _ => false,
        }
    }

    /// Check if this error is fatal (should stop the whole sync run)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Cancelled(_)
                | Error::Configuration(_)
                | Error::InvalidConfig { .. }
                | Error::ChecksumMismatch { .. }
        )
    }

    /// Get an error code for logging
    pub fn code(&self) -> &'static str {
        match self {
            Error::Fetch { .. } => "FETCH_FAILED",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Parse(_) => "PARSE_ERROR",
            Error::InvalidRecord { .. } => "INVALID_RECORD",
            Error::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::DatabaseBusy(_) => "DATABASE_BUSY",
            Error::Configuration(_) => "CONFIG_ERROR",
            Error::InvalidConfig { .. } => "INVALID_CONFIG",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Statuses worth another attempt: request timeout, rate limited, server errors
fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryable_by_status() {
        assert!(Error::fetch("http://x", Some(503), "unavailable").is_retryable());
        assert!(Error::fetch("http://x", Some(429), "slow down").is_retryable());
        assert!(Error::fetch("http://x", None, "connection reset").is_retryable());
        assert!(!Error::fetch("http://x", Some(404), "missing").is_retryable());
    }

    #[test]
    fn test_busy_retryable_timeout_not() {
        assert!(Error::DatabaseBusy("locked".into()).is_retryable());
        let timeout = Error::Timeout {
            operation: "bulk upsert into cves".into(),
            seconds: 1,
        };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Cancelled("sync".into()).is_fatal());
        let mismatch = Error::ChecksumMismatch {
            path: "a.json".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.is_retryable());
        assert!(!Error::Parse("bad".into()).is_fatal());
    }

    #[test]
    fn test_error_display_and_code() {
        let err = Error::fetch("https://feed/x.meta", Some(500), "server error");
        assert_eq!(err.code(), "FETCH_FAILED");
        let text = err.to_string();
        assert!(text.contains("https://feed/x.meta"));
        assert!(text.contains("500"));
    }
}
