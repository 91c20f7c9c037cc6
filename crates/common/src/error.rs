//! Error types shared across the core.

use std::sync::Arc;

/// Errors raised by the chunk and metadata subsystems.
///
/// The enum is `Clone` because one fetch result is broadcast to every
/// waiter attached to it; non-clonable sources are held behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Metadata lookup found no record
    #[error("not found: {0}")]
    NotFound(String),

    /// Token load or refresh failure
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP or DNS failure
    #[error("transport error: {0}")]
    Transport(Arc<reqwest::Error>),

    /// Response status that is neither success nor a retryable throttle
    #[error("unexpected response status {status}")]
    Protocol { status: u16 },

    /// Throttle retries exhausted
    #[error("rate limit retries exhausted")]
    QuotaExceeded,

    /// In-flight request exceeded its deadline and all retries
    #[error("request timed out")]
    Timeout,

    /// Chunk header or CRC mismatch
    #[error("chunk integrity check failed: {0}")]
    Integrity(String),

    /// Disk failure on the chunk store or the metadata store
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// SQLite failure in the metadata store
    #[error("database error: {0}")]
    Database(Arc<sqlx::Error>),

    /// Metadata schema migration failure
    #[error("migration error: {0}")]
    Migration(Arc<sqlx::migrate::MigrateError>),

    /// Remote JSON or stored record could not be decoded
    #[error("decode error: {0}")]
    Decode(Arc<serde_json::Error>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object name that cannot be indexed
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Byte range whose end precedes its start
    #[error("invalid byte range {start}-{end}")]
    InvalidRange { start: u64, end: u64 },

    /// Reserved; the core does not cancel requests today
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(Arc::new(e))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Migration(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(Arc::new(e))
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
