//! Error types for kvmops-core.

use thiserror::Error;

/// Result type alias for kvmops-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during machine lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from kvmops-vm (configuration, precondition, external tool, lease wait)
    #[error(transparent)]
    Vm(#[from] kvmops_vm::VmError),

    /// Operation not allowed in the machine's current state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// A field the operation depends on has not been recorded yet
    #[error("machine identity has no {0}")]
    MissingIdentity(&'static str),

    /// Identity store failure
    #[error("identity store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
