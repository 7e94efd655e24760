//! Error types for gpulet

use thiserror::Error;

/// Main error type for gpulet
#[derive(Error, Debug)]
pub enum GpuletError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not enough free GPU devices to satisfy a reservation.
    ///
    /// This is backpressure, not a failure: the scheduler keeps the task
    /// pending and retries on the next scan.
    #[error("Insufficient GPUs: requested {requested}, available {available}")]
    InsufficientGpus { requested: u32, available: u32 },

    /// Script file does not exist
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// Script file exists but cannot be read
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Process spawning or supervision error
    #[error("Execution error: {0}")]
    Exec(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// GPU probe error
    #[error("GPU probe error: {0}")]
    Probe(String),

    /// Device ledger corruption (double reservation, release of a free
    /// device). Fatal to the scheduler: scheduling stops rather than risk
    /// handing one device to two tasks.
    #[error("GPU ledger corrupted: {0}")]
    LedgerCorrupted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpulet operations
pub type GpuletResult<T> = Result<T, GpuletError>;

impl GpuletError {
    /// Whether this error is the expected scarcity signal rather than a
    /// genuine failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, GpuletError::InsufficientGpus { .. })
    }

    /// Whether this error indicates ledger corruption and must stop the
    /// scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuletError::LedgerCorrupted(_))
    }
}

impl From<serde_json::Error> for GpuletError {
    fn from(err: serde_json::Error) -> Self {
        GpuletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GpuletError {
    fn from(err: toml::de::Error) -> Self {
        GpuletError::Config(err.to_string())
    }
}
