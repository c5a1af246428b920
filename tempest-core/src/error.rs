//! Error types for Tempest
//!
//! Provides a unified error type for snapshot and telemetry operations.

use thiserror::Error;

/// Result type alias for Tempest core operations
pub type Result<T> = std::result::Result<T, TempestError>;

/// Unified error type for Tempest core
#[derive(Error, Debug)]
pub enum TempestError {
    // ===== Routing Errors =====
    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid shard state for {shard}: expected {expected}, found {found}")]
    InvalidShardState {
        shard: String,
        expected: String,
        found: String,
    },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TempestError {
    fn from(err: serde_json::Error) -> Self {
        TempestError::Serialization(err.to_string())
    }
}
