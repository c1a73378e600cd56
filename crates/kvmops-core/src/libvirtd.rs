//! libvirt/KVM implementation of [`MachineBackend`].
//!
//! The presence of `vm_id` in the identity is the re-entry guard: while it
//! is unset `create` provisions disks and registers the domain; once set,
//! `create` goes straight to `start`. Nothing is rolled back on failure,
//! so every step records its result before the next one runs.

use crate::backend::{MachineBackend, MachineState};
use crate::config::ControllerConfig;
use crate::error::{CoreError, Result};
use crate::identity::{MachineIdentity, MachineKey};
use crate::image::ImageBuilder;
use crate::keys::KeyPairSource;
use crate::store::IdentityStore;
use async_trait::async_trait;
use chrono::Utc;
use kvmops_vm::{
    extra_disk_path, primary_disk_path, render_domain, resolve_address, wait_for_address,
    CommandRunner, Definition, DiskProvisioner, DomainIdentity, ExtraDisk, MacAddress, Virsh,
    VmError,
};
use nix::unistd::{access, AccessFlags};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// External collaborators a [`LibvirtdMachine`] drives.
#[derive(Clone)]
pub struct MachineServices {
    pub runner: Arc<dyn CommandRunner>,
    pub store: Arc<dyn IdentityStore>,
    pub images: Arc<dyn ImageBuilder>,
    pub keys: Arc<dyn KeyPairSource>,
}

/// One libvirt domain and its persisted identity.
pub struct LibvirtdMachine {
    key: MachineKey,
    config: ControllerConfig,
    identity: MachineIdentity,
    store: Arc<dyn IdentityStore>,
    images: Arc<dyn ImageBuilder>,
    keys: Arc<dyn KeyPairSource>,
    virsh: Virsh,
    disks: DiskProvisioner,
    rng: StdRng,
    destroyed: bool,
}

impl LibvirtdMachine {
    /// Load the machine's identity from the store, or start from an empty one.
    pub async fn open(
        key: MachineKey,
        config: ControllerConfig,
        services: MachineServices,
    ) -> Result<Self> {
        config.validate()?;
        let identity = services.store.load(&key).await?.unwrap_or_default();
        tracing::debug!(
            machine = %key,
            provisioned = identity.is_provisioned(),
            "Opened machine"
        );

        Ok(Self {
            virsh: Virsh::new(services.runner.clone(), config.connect_uri.clone()),
            disks: DiskProvisioner::new(services.runner),
            store: services.store,
            images: services.images,
            keys: services.keys,
            rng: StdRng::from_os_rng(),
            destroyed: false,
            identity,
            config,
            key,
        })
    }

    /// Replace the random source used for MAC generation.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn key(&self) -> &MachineKey {
        &self.key
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    /// Address to reach the machine over SSH.
    pub fn ssh_address(&self) -> Result<&str> {
        self.identity
            .private_ipv4
            .as_deref()
            .ok_or(CoreError::MissingIdentity("private IPv4 address"))
    }

    /// Client private key authorized in the guest.
    pub fn ssh_private_key(&self) -> Option<&str> {
        self.identity
            .ssh_key_pair
            .as_ref()
            .map(|pair| pair.private_key.as_str())
    }

    /// Render the descriptor `definition` would produce for this machine.
    ///
    /// Needs the disk, network and MAC recorded by a previous `create`.
    /// Nothing is persisted or registered.
    pub fn render_descriptor(&self, definition: &Definition) -> Result<String> {
        let vm_id = self
            .identity
            .vm_id
            .clone()
            .unwrap_or_else(|| self.key.vm_id(&self.config.vm_id_prefix));
        let emulator = self.config.resolve_emulator()?;
        self.render(definition, &vm_id, &emulator)
    }

    /// Render with only the recorded extra disks `definition` still lists.
    fn render(&self, definition: &Definition, vm_id: &str, emulator: &Path) -> Result<String> {
        let attached: BTreeMap<String, ExtraDisk> = self
            .identity
            .extra_disks
            .iter()
            .filter(|(name, _)| definition.disks.contains_key(*name))
            .map(|(name, disk)| (name.clone(), disk.clone()))
            .collect();
        let identity = DomainIdentity {
            extra_disks: &attached,
            ..self.identity.domain_view(vm_id)?
        };
        Ok(render_domain(definition, identity, emulator))
    }

    async fn save(&self) -> Result<()> {
        self.store.save(&self.key, &self.identity).await
    }

    fn defined_vm_id(&self) -> Result<String> {
        match (&self.identity.vm_id, self.state()) {
            (Some(vm_id), MachineState::Defined) => Ok(vm_id.clone()),
            (_, actual) => Err(CoreError::InvalidState {
                expected: MachineState::Defined.to_string(),
                actual: actual.to_string(),
            }),
        }
    }

    fn lease_target(&self) -> Result<(String, MacAddress)> {
        let network = self
            .identity
            .primary_net
            .clone()
            .ok_or(CoreError::MissingIdentity("primary network"))?;
        let mac = self
            .identity
            .primary_mac
            .ok_or(CoreError::MissingIdentity("primary MAC"))?;
        Ok((network, mac))
    }

    /// Record the primary network on first use and check it still exists.
    fn select_primary_net(&mut self, definition: &Definition) -> Result<bool> {
        if let Some(net) = &self.identity.primary_net {
            if definition.networks.contains(net) {
                return Ok(false);
            }
            return Err(VmError::Configuration(format!(
                "primary network `{net}` is no longer among the machine's networks"
            ))
            .into());
        }

        let net = definition
            .default_primary_network()
            .ok_or_else(|| VmError::Configuration("at least one network is required".into()))?;
        self.identity.primary_net = Some(net.to_string());
        Ok(true)
    }

    /// Return the client public key, generating the pair on first use.
    async fn ensure_key_pair(&mut self) -> Result<String> {
        if let Some(pair) = &self.identity.ssh_key_pair {
            return Ok(pair.public_key.clone());
        }
        let pair = self.keys.generate().await?;
        let public_key = pair.public_key.clone();
        self.identity.ssh_key_pair = Some(pair);
        self.save().await?;
        Ok(public_key)
    }

    async fn write_descriptor(&self, vm_id: &str, descriptor: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let path = self.config.work_dir.join(format!("{vm_id}-domain.xml"));
        tokio::fs::write(&path, descriptor).await?;
        Ok(path)
    }

    async fn provision(&mut self, definition: &Definition) -> Result<()> {
        let start = std::time::Instant::now();
        let vm_id = self.key.vm_id(&self.config.vm_id_prefix);
        tracing::info!(machine = %self.key, %vm_id, "Provisioning machine");

        ensure_writable(&definition.image_dir)?;
        let emulator = self.config.resolve_emulator()?;

        if self.select_primary_net(definition)? {
            self.save().await?;
        }
        let public_key = self.ensure_key_pair().await?;

        // 1. Primary disk from the built base image
        let base = self.images.base_image(&self.key.name, &public_key).await?;
        let disk_path = primary_disk_path(&definition.image_dir, &vm_id);
        self.disks.provision_primary(&base, &disk_path).await?;
        self.identity.disk_path = Some(disk_path);
        self.save().await?;

        // 2. Extra disks as copy-on-write overlays. Entries recorded by an
        // earlier attempt stay until destroy, even if no longer defined.
        for (name, disk) in &definition.disks {
            let base = match &disk.base_image {
                Some(path) => path.clone(),
                None => {
                    self.images
                        .extra_disk_image(&self.key.name, name, disk.size)
                        .await?
                }
            };
            let image_path = extra_disk_path(&definition.image_dir, &vm_id, name);
            self.disks.provision_extra(&base, &image_path).await?;
            self.identity.extra_disks.insert(
                name.clone(),
                ExtraDisk {
                    device: disk.device.clone(),
                    image_path,
                },
            );
            self.save().await?;
        }

        // 3. Network identity
        if self.identity.assign_mac(&mut self.rng) {
            tracing::debug!(machine = %self.key, mac = ?self.identity.primary_mac, "Assigned MAC");
            self.save().await?;
        }

        // 4. Descriptor
        let descriptor = self.render(definition, &vm_id, &emulator)?;
        self.identity.domain_xml = Some(descriptor.clone());
        self.identity.vcpu = Some(definition.vcpu);
        self.save().await?;

        // 5. Persistent registration
        let descriptor_file = self.write_descriptor(&vm_id, &descriptor).await?;
        self.virsh.define(&descriptor_file).await?;

        self.identity.vm_id = Some(vm_id.clone());
        self.identity.created_at = Some(Utc::now());
        self.save().await?;

        tracing::info!(
            machine = %self.key,
            %vm_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Domain defined"
        );
        Ok(())
    }
}

#[async_trait]
impl MachineBackend for LibvirtdMachine {
    fn state(&self) -> MachineState {
        if self.destroyed {
            MachineState::Destroyed
        } else if self.identity.is_provisioned() {
            MachineState::Defined
        } else {
            MachineState::Unprovisioned
        }
    }

    async fn create(
        &mut self,
        definition: &Definition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.destroyed {
            return Err(CoreError::InvalidState {
                expected: "Unprovisioned or Defined".into(),
                actual: MachineState::Destroyed.to_string(),
            });
        }
        definition.validate()?;

        if self.identity.is_provisioned() {
            tracing::debug!(machine = %self.key, "Already provisioned, skipping to start");
        } else {
            self.provision(definition).await?;
        }

        self.start(cancel).await
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let vm_id = self.defined_vm_id()?;
        if self.identity.domain_xml.is_none() {
            return Err(CoreError::MissingIdentity("domain descriptor"));
        }
        let (network, mac) = self.lease_target()?;

        if self.virsh.is_running(&vm_id).await? {
            tracing::info!(%vm_id, "Domain already running, reconnecting");
            let address = resolve_address(&self.virsh, &network, &mac).await?;
            if address.is_none() {
                tracing::warn!(%vm_id, %network, "Running domain holds no DHCP lease");
            }
            self.identity.private_ipv4 = address;
        } else {
            tracing::info!(%vm_id, "Starting domain");
            self.virsh.start(&vm_id).await?;
            let address =
                wait_for_address(&self.virsh, &network, &mac, self.config.lease_wait(), cancel)
                    .await?;
            self.identity.private_ipv4 = Some(address);
        }

        self.save().await?;
        tracing::info!(
            %vm_id,
            address = self.identity.private_ipv4.as_deref().unwrap_or("-"),
            "Domain up"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let vm_id = self.defined_vm_id()?;
        if self.virsh.is_running(&vm_id).await? {
            tracing::info!(%vm_id, "Shutting down domain");
            self.virsh.destroy(&vm_id).await?;
        } else {
            tracing::info!(%vm_id, "Domain not running");
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(vm_id) = self.identity.vm_id.clone() else {
            tracing::debug!(machine = %self.key, "Nothing provisioned, nothing to destroy");
            return Ok(());
        };
        if self.destroyed {
            return Ok(());
        }

        let start = std::time::Instant::now();
        tracing::info!(machine = %self.key, %vm_id, "Destroying machine");

        self.stop().await?;
        // A retry after a failed disk removal finds the domain already gone.
        if self.virsh.is_defined(&vm_id).await? {
            self.virsh.undefine(&vm_id).await?;
        } else {
            tracing::info!(%vm_id, "Domain already undefined");
        }

        if let Some(path) = &self.identity.disk_path {
            self.disks.remove(path).await?;
        }
        for disk in self.identity.extra_disks.values() {
            self.disks.remove(&disk.image_path).await?;
        }

        self.store.remove(&self.key).await?;
        self.identity = MachineIdentity::default();
        self.destroyed = true;

        tracing::info!(
            machine = %self.key,
            %vm_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Machine destroyed"
        );
        Ok(())
    }

    async fn resolve_address(&self) -> Result<Option<String>> {
        self.defined_vm_id()?;
        let (network, mac) = self.lease_target()?;
        Ok(resolve_address(&self.virsh, &network, &mac).await?)
    }
}

fn ensure_writable(dir: &Path) -> Result<()> {
    access(dir, AccessFlags::W_OK).map_err(|e| {
        VmError::Precondition(format!(
            "{} is not writable by this user or it does not exist ({e})",
            dir.display()
        ))
    })?;
    Ok(())
}
