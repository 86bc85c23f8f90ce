//! Error types for the backup engine.

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A container cannot be backed up as labelled.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unsafe command shape or TLS misconfiguration.
    #[error("Security error: {0}")]
    Security(String),

    /// Transport-level container runtime problem.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The container runtime reported a timeout.
    #[error("Runtime timeout: {0}")]
    RuntimeTimeout(String),

    /// Disk full, permission denied, unreadable file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Gzip stream failure distinct from plain IO.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Authentication failure or key problem.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Empty or too-small artifact.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// No dump strategy is registered for the requested engine.
    #[error("Unsupported database engine: {0}")]
    UnsupportedEngine(String),

    /// Task submitted after the worker pool was shut down.
    #[error("Worker pool is shut down")]
    PoolShutDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the per-container pipeline may retry after this error.
    ///
    /// Only transport and disk problems are worth another attempt; a
    /// validation, security, encryption, or integrity failure will fail
    /// the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Runtime(_) | Error::RuntimeTimeout(_)
        )
    }

    /// Short machine-readable kind, used in structured log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::Security(_) => "security",
            Error::Runtime(_) => "runtime",
            Error::RuntimeTimeout(_) => "runtime_timeout",
            Error::Io(_) => "io",
            Error::Compression(_) => "compression",
            Error::Encryption(_) => "encryption",
            Error::Integrity(_) => "integrity",
            Error::UnsupportedEngine(_) => "unsupported_engine",
            Error::PoolShutDown => "pool_shut_down",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, Error>;
