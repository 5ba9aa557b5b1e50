//! Error types for pakt.

use thiserror::Error;

/// The main error type for pakt operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Search index error: {0}")]
    SearchIndexError(String),

    #[error("Worker not available: {0}")]
    WorkerUnavailable(String),

    #[error("Worker is busy with another job")]
    WorkerBusy,

    #[error("Worker protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

/// A type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
