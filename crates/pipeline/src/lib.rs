pub mod alerts;
pub mod analysis;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod store;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("Client error: {0}")]
    Client(String),
    #[error("Circuit '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used by the retry and circuit breaker layers.
/// The retryable set and the breaker exclusion list are both expressed in
/// terms of these kinds rather than concrete `Error` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Infrastructure hiccups that are expected to heal on their own.
    Transient,
    /// The caller sent something the downstream service will never accept.
    Client,
    /// Rejected locally by an open circuit breaker.
    CircuitOpen,
    /// Storage backend failures.
    Storage,
    Config,
    Serde,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Client(_) | Error::Uuid(_) => ErrorKind::Client,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Config(_) => ErrorKind::Config,
            Error::Storage(_) | Error::Sqlx(_) | Error::Migrate(_) => ErrorKind::Storage,
            Error::SerdeJson(_) => ErrorKind::Serde,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
