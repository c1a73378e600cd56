//! # kvmops-core
//!
//! Idempotent lifecycle controller for one libvirt-managed KVM machine.
//!
//! A [`LibvirtdMachine`] pairs a [`MachineKey`] with the persisted
//! [`MachineIdentity`] it accumulates while provisioning. Every step is
//! recorded in an [`IdentityStore`] before the next one runs, so a failed
//! `create` can simply be repeated.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvmops_core::{
//!     ControllerConfig, JsonFileStore, LibvirtdMachine, MachineBackend, MachineKey,
//!     MachineServices, NixImageBuilder, SshKeygen,
//! };
//! use kvmops_vm::{DefinitionBuilder, SystemRunner};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> kvmops_core::Result<()> {
//! let runner = Arc::new(SystemRunner);
//! let services = MachineServices {
//!     runner: runner.clone(),
//!     store: Arc::new(JsonFileStore::new("/var/lib/kvmops")),
//!     images: Arc::new(NixImageBuilder::new(runner.clone(), "/tmp/kvmops")),
//!     keys: Arc::new(SshKeygen::new(runner)),
//! };
//!
//! let key = MachineKey::new(uuid::Uuid::new_v4(), "web");
//! let mut machine = LibvirtdMachine::open(key, ControllerConfig::default(), services).await?;
//!
//! let defn = DefinitionBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(1024)
//!     .network("default")
//!     .build()?;
//! machine.create(&defn, &CancellationToken::new()).await?;
//! println!("ssh root@{}", machine.ssh_address()?);
//!
//! machine.destroy().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Unprovisioned --create--> Defined --destroy--> Destroyed
//!                            |   ^
//!                        stop|   |start
//!                            v   |
//!                        (stopped)
//! ```

mod backend;
mod config;
mod error;
mod identity;
mod image;
mod keys;
mod libvirtd;
mod store;

pub use backend::{MachineBackend, MachineState};
pub use config::{ControllerConfig, ControllerConfigBuilder, DEFAULT_VM_ID_PREFIX};
pub use error::{CoreError, Result};
pub use identity::{MachineIdentity, MachineKey, SshKeyPair};
pub use image::{ImageBuilder, NixImageBuilder, IMAGE_FILE, PUBKEY_ENV};
pub use keys::{KeyPairSource, SshKeygen};
pub use libvirtd::{LibvirtdMachine, MachineServices};
pub use store::{IdentityStore, JsonFileStore, MemoryStore};
