// src/error.rs

//! Unified error handling for the collection daemon.

use std::fmt;

use thiserror::Error;

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, CollectError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum CollectError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Database query failed (storage reachable, statement rejected)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage stayed unreachable through the whole reconnect schedule.
    ///
    /// Cycle-fatal: callers must propagate this unchanged up to the
    /// orchestration layer. Check with [`CollectError::is_fatal`].
    #[error("storage unavailable after {attempts} reconnect attempts: {detail}")]
    StorageUnavailable { attempts: usize, detail: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Collection error with entity context
    #[error("Collect error for {context}: {message}")]
    Collect { context: String, message: String },
}

impl CollectError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a collection error with context.
    pub fn collect(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Collect {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create the cycle-fatal storage-unavailable error.
    pub fn storage_unavailable(attempts: usize, detail: impl fmt::Display) -> Self {
        Self::StorageUnavailable {
            attempts,
            detail: detail.to_string(),
        }
    }

    /// True for errors that must abort the current cycle instead of being
    /// recorded against a single entity.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

/// Process exit code for a storage outage in single-run mode.
///
/// Matches sysexits EX_TEMPFAIL: the run failed for a temporary reason and
/// the supervisor should retry later.
pub const STORAGE_UNAVAILABLE_EXIT_CODE: u8 = 75;
