//! Builder pattern for ergonomic Definition construction.

use crate::definition::{Definition, DiskDefinition};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default location of libvirt disk images.
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// Fluent builder for [`Definition`] values.
///
/// # Example
///
/// ```
/// use kvmops_vm::DefinitionBuilder;
///
/// # fn example() -> kvmops_vm::Result<()> {
/// let defn = DefinitionBuilder::new()
///     .vcpus(2)
///     .memory_mib(1024)
///     .network("default")
///     .headless(true)
///     .disk("data", "vdb", 10240)
///     .build()?;
/// assert_eq!(defn.networks, vec!["default"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    definition: Definition,
}

impl Default for DefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionBuilder {
    /// Create a builder with one vCPU, 512 MiB, the default image directory
    /// and no networks.
    pub fn new() -> Self {
        Self {
            definition: Definition {
                vcpu: 1,
                memory_size: 512,
                extra_devices_xml: String::new(),
                extra_domain_xml: String::new(),
                headless: false,
                image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
                networks: Vec::new(),
                disks: BTreeMap::new(),
            },
        }
    }

    pub fn vcpus(mut self, count: u32) -> Self {
        self.definition.vcpu = count;
        self
    }

    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.definition.memory_size = mib;
        self
    }

    pub fn image_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.definition.image_dir = path.into();
        self
    }

    /// Attach a network. Order of calls is interface order.
    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.definition.networks.push(name.into());
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.definition.headless = headless;
        self
    }

    /// Add an extra disk whose base image is generated at provisioning time.
    pub fn disk(mut self, name: &str, device: &str, size: u64) -> Self {
        self.definition.disks.insert(
            name.to_string(),
            DiskDefinition {
                device: device.to_string(),
                size,
                base_image: None,
            },
        );
        self
    }

    /// Add an extra disk backed by an existing base image.
    pub fn disk_from_image(
        mut self,
        name: &str,
        device: &str,
        size: u64,
        base_image: impl Into<PathBuf>,
    ) -> Self {
        self.definition.disks.insert(
            name.to_string(),
            DiskDefinition {
                device: device.to_string(),
                size,
                base_image: Some(base_image.into()),
            },
        );
        self
    }

    pub fn extra_devices_xml(mut self, xml: impl Into<String>) -> Self {
        self.definition.extra_devices_xml = xml.into();
        self
    }

    pub fn extra_domain_xml(mut self, xml: impl Into<String>) -> Self {
        self.definition.extra_domain_xml = xml.into();
        self
    }

    /// Validate and return the definition.
    ///
    /// # Errors
    /// Returns an error if the definition violates any constraint checked by
    /// [`Definition::validate`].
    pub fn build(self) -> Result<Definition> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
