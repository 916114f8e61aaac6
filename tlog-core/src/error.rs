//! Error types for tlog-core

use thiserror::Error;

/// Main error type for the tlog-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage (SQLite) error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage area unavailable or failing
    #[error("storage error: {0}")]
    Storage(String),

    /// A storage write did not fit in the area's quota
    #[error("storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },

    /// Rejected event input (only surfaced in QA mode)
    #[error("validation error: {0}")]
    Validation(String),

    /// Session could not be started; all partial setup was unwound
    #[error("failed to start session: {0}")]
    SessionStart(String),
}

/// Result type alias for tlog-core
pub type Result<T> = std::result::Result<T, Error>;
