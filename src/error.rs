//! hostbridge error types

use thiserror::Error;

/// hostbridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Addon registration or validation error
    #[error("Addon error: {0}")]
    Addon(String),

    /// Broker transport error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Agent IPC channel error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Session or process facts error
    #[error("Session error: {0}")]
    Session(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hostbridge operations
pub type Result<T> = std::result::Result<T, Error>;
