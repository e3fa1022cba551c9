// src/utils/errors.rs
//! Error types for the capture tape
//!
//! Every failure in the recorder maps to one of these variants. None of them
//! is fatal to the host process; callers check the returned status.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TapeError>;

/// Capture tape errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TapeError {
    /// Bad path, existing file without overwrite, store already open
    #[error("Tape setup failed: {0}")]
    SetupFailed(String),

    /// Transient condition, safe to retry
    #[error("Tape busy: {0}")]
    Busy(String),

    /// Worker dead, unresponsive or shutting down
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Record whose windows do not fit its arrays
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to spawn recorder worker: {0}")]
    WorkerSpawnFailed(String),
}

impl TapeError {
    /// True for errors that mean the handle must not be reused
    pub fn is_fatal_for_handle(&self) -> bool {
        matches!(self, TapeError::Cancelled | TapeError::WorkerSpawnFailed(_))
    }
}

impl From<rusqlite::Error> for TapeError {
    fn from(e: rusqlite::Error) -> Self {
        TapeError::StorageFailed(e.to_string())
    }
}

impl From<serde_json::Error> for TapeError {
    fn from(e: serde_json::Error) -> Self {
        TapeError::StorageFailed(format!("Attribute encoding error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TapeError::SetupFailed("Path to /x/y.tape not found".to_string());
        assert_eq!(err.to_string(), "Tape setup failed: Path to /x/y.tape not found");
        assert_eq!(TapeError::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_fatal_for_handle() {
        assert!(TapeError::Cancelled.is_fatal_for_handle());
        assert!(!TapeError::Busy("queue full".into()).is_fatal_for_handle());
    }
}
