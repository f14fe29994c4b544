/// Unified error types for the Polaris ID engine
use thiserror::Error;

/// Main error type for the engine
///
/// Nothing in the engine is fatal to the host: these errors are caught and
/// logged at their subsystem boundary, and resolution degrades to delivering
/// an empty or cached identity. They surface to callers only through logs.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Partner configuration errors (missing/invalid partner id)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Cipher errors (malformed armor, bad UTF-8 after decrypt)
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// JSON decode errors for persisted records and server responses
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Network transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO errors (cookie jar file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
