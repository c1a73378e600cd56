//! # kvmops-vm
//!
//! Building blocks for a libvirt-managed KVM machine: the declarative
//! [`Definition`], MAC identity and DHCP lease lookup, disk image
//! provisioning, and the domain descriptor.
//!
//! ## Quick Start
//!
//! ```
//! use kvmops_vm::{render_domain, DefinitionBuilder, DomainIdentity, MacAddress};
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! # fn example() -> kvmops_vm::Result<()> {
//! let defn = DefinitionBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(1024)
//!     .network("default")
//!     .headless(true)
//!     .build()?;
//!
//! let mac: MacAddress = "52:54:00:12:34:56".parse()?;
//! let xml = render_domain(
//!     &defn,
//!     DomainIdentity {
//!         vm_id: "nixops-1234-web",
//!         disk_path: Path::new("/var/lib/libvirt/images/nixops-1234-web.img"),
//!         primary_net: "default",
//!         primary_mac: &mac,
//!         extra_disks: &BTreeMap::new(),
//!     },
//!     Path::new("/usr/bin/qemu-system-x86_64"),
//! );
//! assert!(xml.contains("<vcpu>2</vcpu>"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Definition parsing**: JSON attribute form, validated into typed values
//! - **Network identity**: `52:54:00` MACs from an injected RNG, lease lookup, cancellable lease wait
//! - **Disk provisioning**: primary disk copy + rebase, copy-on-write extra disks
//! - **Descriptor builder**: typed elements rendered to domain XML in one step
//! - **Host commands**: every external tool runs through [`CommandRunner`]

mod builder;
pub mod command;
mod definition;
pub mod descriptor;
pub mod disk;
mod error;
pub mod network;
mod virsh;

pub use builder::{DefinitionBuilder, DEFAULT_IMAGE_DIR};
pub use command::{CommandRunner, HostCommand, SystemRunner};
pub use definition::{Definition, DiskDefinition, PRIMARY_DISK_DEVICE};
pub use descriptor::{
    build_domain, locate_emulator, render_domain, DomainDescriptor, DomainIdentity,
    DEFAULT_EMULATOR,
};
pub use disk::{extra_disk_path, primary_disk_path, DiskProvisioner, ExtraDisk};
pub use error::{Result, VmError};
pub use network::{resolve_address, wait_for_address, LeaseWait, MacAddress};
pub use virsh::{Virsh, DEFAULT_CONNECT_URI};

#[cfg(any(test, feature = "testing"))]
pub use command::ScriptedRunner;
