//! Error types for kvmops-vm.

use thiserror::Error;

/// Result type alias for kvmops-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while preparing or driving a domain.
#[derive(Debug, Error)]
pub enum VmError {
    /// Malformed or incomplete machine definition
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Host environment is unsuitable (unwritable image dir, missing emulator)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An external command exited unsuccessfully or could not be spawned
    #[error("`{program}` failed ({status}): {stderr}")]
    ExternalTool {
        /// Program that was invoked
        program: String,
        /// Exit status or spawn failure description
        status: String,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// Timed out waiting for a DHCP lease
    #[error("no DHCP lease after {0:?}")]
    Timeout(std::time::Duration),

    /// Wait was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
