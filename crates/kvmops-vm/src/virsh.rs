//! Thin wrapper over the `virsh` command line.
//!
//! Only the handful of verbs the lifecycle needs are exposed. Nothing is
//! cached: every query goes to the hypervisor.

use crate::command::{CommandRunner, HostCommand};
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Default libvirt connection URI.
pub const DEFAULT_CONNECT_URI: &str = "qemu:///system";

/// `virsh` bound to one connection URI.
#[derive(Clone)]
pub struct Virsh {
    runner: Arc<dyn CommandRunner>,
    uri: String,
}

impl Virsh {
    pub fn new(runner: Arc<dyn CommandRunner>, uri: impl Into<String>) -> Self {
        Self {
            runner,
            uri: uri.into(),
        }
    }

    /// The connection URI passed as `-c` to every call.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn command<I, S>(&self, args: I) -> HostCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HostCommand::new("virsh").args(["-c", self.uri.as_str()]).args(args)
    }

    /// Register a persistent domain from a descriptor file.
    ///
    /// `define` (rather than `create`) makes the domain survive host reboots.
    pub async fn define(&self, descriptor_file: &Path) -> Result<()> {
        tracing::debug!(file = %descriptor_file.display(), "Defining domain");
        self.runner
            .run(&self.command(["define".to_string(), descriptor_file.display().to_string()]))
            .await?;
        Ok(())
    }

    pub async fn start(&self, vm_id: &str) -> Result<()> {
        tracing::debug!(vm_id, "Starting domain");
        self.runner.run(&self.command(["start", vm_id])).await?;
        Ok(())
    }

    /// Force-stop a running domain.
    pub async fn destroy(&self, vm_id: &str) -> Result<()> {
        tracing::debug!(vm_id, "Force-stopping domain");
        self.runner.run(&self.command(["destroy", vm_id])).await?;
        Ok(())
    }

    /// Remove the persistent domain registration.
    pub async fn undefine(&self, vm_id: &str) -> Result<()> {
        tracing::debug!(vm_id, "Undefining domain");
        self.runner.run(&self.command(["undefine", vm_id])).await?;
        Ok(())
    }

    /// Raw output of `virsh list` (running domains only).
    pub async fn list(&self) -> Result<String> {
        self.runner.run(&self.command(["list"])).await
    }

    /// Whether `vm_id` appears among the running domains.
    pub async fn is_running(&self, vm_id: &str) -> Result<bool> {
        let listing = self.list().await?;
        let running = listing_contains(&listing, vm_id);
        tracing::trace!(vm_id, running, "Checked domain state");
        Ok(running)
    }

    /// Whether `vm_id` is registered at all, running or not.
    pub async fn is_defined(&self, vm_id: &str) -> Result<bool> {
        let listing = self
            .runner
            .run(&self.command(["list", "--all", "--name"]))
            .await?;
        Ok(listing_contains(&listing, vm_id))
    }

    /// Raw output of `virsh net-dhcp-leases --network <network>`.
    pub async fn dhcp_leases(&self, network: &str) -> Result<String> {
        self.runner
            .run(&self.command(["net-dhcp-leases", "--network", network]))
            .await
    }
}

/// Match `vm_id` against whole whitespace-separated tokens of a `virsh list` table.
fn listing_contains(listing: &str, vm_id: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().any(|token| token == vm_id))
}
