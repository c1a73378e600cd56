//! Hypervisor-independent machine lifecycle interface.

use crate::error::Result;
use async_trait::async_trait;
use kvmops_vm::Definition;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a managed machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Nothing provisioned; no domain registered.
    Unprovisioned,
    /// Disks provisioned and domain registered; may be running or stopped.
    Defined,
    /// Torn down. Terminal for this handle.
    Destroyed,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprovisioned => write!(f, "Unprovisioned"),
            Self::Defined => write!(f, "Defined"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// Operations every hypervisor backend provides.
///
/// All operations are re-entrant: a failed call leaves whatever partial
/// state it reached, and repeating the call resumes from there.
#[async_trait]
pub trait MachineBackend: Send {
    fn state(&self) -> MachineState;

    /// Provision and register the machine if needed, then start it.
    async fn create(&mut self, definition: &Definition, cancel: &CancellationToken)
        -> Result<()>;

    /// Start the machine, or reconnect if it is already running.
    async fn start(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Force-stop the machine if it is running.
    async fn stop(&mut self) -> Result<()>;

    /// Stop, unregister and delete the machine's disks.
    async fn destroy(&mut self) -> Result<()>;

    /// Current address of the machine, if it holds a lease.
    async fn resolve_address(&self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_state_display() {
        assert_eq!(format!("{}", MachineState::Unprovisioned), "Unprovisioned");
        assert_eq!(format!("{}", MachineState::Defined), "Defined");
        assert_eq!(format!("{}", MachineState::Destroyed), "Destroyed");
    }
}
