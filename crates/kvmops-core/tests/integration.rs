//! Integration tests for kvmops-core.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - libvirtd with the `default` network active, reachable as `qemu:///system`
//! - `qemu-img`, `ssh-keygen` and `qemu-system-x86_64` on PATH
//! - A bootable qcow2 guest image that requests a DHCP lease
//!
//! Run with: `cargo test -p kvmops-core -- --ignored`

use async_trait::async_trait;
use kvmops_core::{
    ControllerConfig, LibvirtdMachine, MachineBackend, MachineKey, MachineServices, MachineState,
    MemoryStore, SshKeygen,
};
use kvmops_vm::{DefinitionBuilder, SystemRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Serves a prebuilt guest image instead of building one with Nix.
struct PrebuiltImage(PathBuf);

#[async_trait]
impl kvmops_core::ImageBuilder for PrebuiltImage {
    async fn base_image(&self, _machine: &str, _public_key: &str) -> kvmops_core::Result<PathBuf> {
        Ok(self.0.clone())
    }

    async fn extra_disk_image(
        &self,
        _machine: &str,
        _disk_name: &str,
        _size: u64,
    ) -> kvmops_core::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

fn base_image() -> Option<PathBuf> {
    let path = std::env::var("KVMOPS_BASE_IMAGE")
        .unwrap_or_else(|_| "/var/lib/kvmops/base.qcow2".to_string());
    if Path::new(&path).exists() {
        Some(PathBuf::from(path))
    } else {
        eprintln!("Skipping test: base image not found");
        eprintln!("Set KVMOPS_BASE_IMAGE to a bootable qcow2 image");
        None
    }
}

fn image_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("KVMOPS_IMAGE_DIR")
            .unwrap_or_else(|_| "/var/lib/libvirt/images".to_string()),
    )
}

async fn open_machine(base: PathBuf, store: Arc<MemoryStore>) -> LibvirtdMachine {
    let runner = Arc::new(SystemRunner);
    let config = ControllerConfig::builder()
        .lease_timeout(Duration::from_secs(180))
        .build()
        .expect("Invalid controller config");

    LibvirtdMachine::open(
        MachineKey::new(uuid::Uuid::new_v4(), "itest"),
        config,
        MachineServices {
            runner: runner.clone(),
            store,
            images: Arc::new(PrebuiltImage(base)),
            keys: Arc::new(SshKeygen::new(runner)),
        },
    )
    .await
    .expect("Failed to open machine")
}

/// Test full lifecycle: create -> running with lease -> destroy
#[tokio::test]
#[ignore = "requires libvirt + QEMU + KVM"]
async fn test_machine_lifecycle() {
    let Some(base) = base_image() else { return };
    let store = Arc::new(MemoryStore::new());
    let mut machine = open_machine(base, store.clone()).await;

    let defn = DefinitionBuilder::new()
        .vcpus(1)
        .memory_mib(512)
        .headless(true)
        .network("default")
        .image_dir(image_dir())
        .build()
        .expect("Invalid definition");

    machine
        .create(&defn, &CancellationToken::new())
        .await
        .expect("Failed to create machine");

    assert_eq!(machine.state(), MachineState::Defined);
    let address = machine.ssh_address().expect("No address").to_string();
    assert!(address.parse::<std::net::Ipv4Addr>().is_ok());
    let disk = machine.identity().disk_path.clone().expect("No disk");
    assert!(disk.exists());

    machine.destroy().await.expect("Failed to destroy machine");
    assert_eq!(machine.state(), MachineState::Destroyed);
    assert!(!disk.exists());
    assert!(store.is_empty().await);
}

/// Test stop and restart keeps the same identity
#[tokio::test]
#[ignore = "requires libvirt + QEMU + KVM"]
async fn test_machine_stop_restart() {
    let Some(base) = base_image() else { return };
    let mut machine = open_machine(base, Arc::new(MemoryStore::new())).await;

    let defn = DefinitionBuilder::new()
        .headless(true)
        .network("default")
        .image_dir(image_dir())
        .build()
        .expect("Invalid definition");
    let cancel = CancellationToken::new();

    machine.create(&defn, &cancel).await.expect("Failed to create machine");
    let mac = machine.identity().primary_mac;

    machine.stop().await.expect("Failed to stop machine");
    assert_eq!(machine.state(), MachineState::Defined);

    machine.start(&cancel).await.expect("Failed to restart machine");
    assert_eq!(machine.identity().primary_mac, mac);
    assert!(machine.ssh_address().is_ok());

    machine.destroy().await.expect("Failed to destroy machine");
}
