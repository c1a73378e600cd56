//! Declarative machine definition.
//!
//! A [`Definition`] is rebuilt from configuration on every invocation and
//! never persisted. Field names on the wire follow the declarative
//! attribute names (`memorySize`, `extraDevicesXML`, ...).

use crate::error::{Result, VmError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Target device reserved for the primary disk.
pub const PRIMARY_DISK_DEVICE: &str = "hda";

/// Validated machine definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// Virtual CPU count, also used as the core count of the single socket
    pub vcpu: u32,
    /// Memory in MiB
    pub memory_size: u64,
    /// Raw XML appended inside `<devices>`. Operator-trusted, not escaped.
    pub extra_devices_xml: String,
    /// Raw XML appended inside `<domain>`. Operator-trusted, not escaped.
    pub extra_domain_xml: String,
    /// Omit the graphics device
    pub headless: bool,
    /// Directory holding the machine's disk images
    pub image_dir: PathBuf,
    /// Networks to attach, in order
    pub networks: Vec<String>,
    /// Extra disks by name
    pub disks: BTreeMap<String, DiskDefinition>,
}

/// One extra disk in a [`Definition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDefinition {
    /// Guest target device
    pub device: String,
    /// Requested size, passed through to the image builder
    pub size: u64,
    /// Existing base image to back the disk instead of generating one
    pub base_image: Option<PathBuf>,
}

/// Wire shape: every field optional so absence is reported by name.
#[derive(Debug, Deserialize)]
struct RawDefinition {
    vcpu: Option<u32>,
    #[serde(rename = "memorySize")]
    memory_size: Option<u64>,
    #[serde(rename = "extraDevicesXML", default)]
    extra_devices_xml: Option<String>,
    #[serde(rename = "extraDomainXML", default)]
    extra_domain_xml: Option<String>,
    #[serde(default)]
    headless: Option<bool>,
    #[serde(rename = "imageDir")]
    image_dir: Option<String>,
    networks: Option<Vec<String>>,
    #[serde(default)]
    disks: Option<BTreeMap<String, RawDisk>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDisk {
    device: Option<String>,
    size: Option<u64>,
    #[serde(default)]
    base_image: Option<String>,
}

fn missing(field: &str) -> VmError {
    VmError::Configuration(format!("missing required attribute `{field}`"))
}

impl Definition {
    /// Materialize a definition from its JSON form.
    ///
    /// # Errors
    /// [`VmError::Configuration`] if a required attribute is absent or has
    /// the wrong type, or the result fails [`validate`](Self::validate).
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        let raw: RawDefinition = serde_json::from_value(raw.clone())
            .map_err(|e| VmError::Configuration(format!("malformed definition: {e}")))?;

        let mut disks = BTreeMap::new();
        for (name, disk) in raw.disks.unwrap_or_default() {
            let device = disk
                .device
                .ok_or_else(|| missing(&format!("disks.{name}.device")))?;
            let size = disk
                .size
                .ok_or_else(|| missing(&format!("disks.{name}.size")))?;
            disks.insert(
                name,
                DiskDefinition {
                    device,
                    size,
                    base_image: disk.base_image.map(PathBuf::from),
                },
            );
        }

        let definition = Self {
            vcpu: raw.vcpu.ok_or_else(|| missing("vcpu"))?,
            memory_size: raw.memory_size.ok_or_else(|| missing("memorySize"))?,
            extra_devices_xml: raw.extra_devices_xml.unwrap_or_default(),
            extra_domain_xml: raw.extra_domain_xml.unwrap_or_default(),
            headless: raw.headless.unwrap_or(false),
            image_dir: raw
                .image_dir
                .map(PathBuf::from)
                .ok_or_else(|| missing("imageDir"))?,
            networks: raw.networks.ok_or_else(|| missing("networks"))?,
            disks,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a definition from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| VmError::Configuration(format!("definition is not valid JSON: {e}")))?;
        Self::parse(&value)
    }

    /// Check value constraints.
    ///
    /// # Errors
    /// [`VmError::Configuration`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.vcpu == 0 {
            return Err(VmError::Configuration("vcpu must be > 0".into()));
        }
        if self.memory_size == 0 {
            return Err(VmError::Configuration("memorySize must be > 0".into()));
        }
        if self.image_dir.as_os_str().is_empty() {
            return Err(VmError::Configuration("imageDir must not be empty".into()));
        }
        if self.networks.is_empty() {
            return Err(VmError::Configuration(
                "at least one network is required".into(),
            ));
        }
        if let Some(blank) = self.networks.iter().find(|n| n.trim().is_empty()) {
            return Err(VmError::Configuration(format!(
                "network names must not be blank, got {blank:?}"
            )));
        }

        let mut devices = vec![PRIMARY_DISK_DEVICE];
        for (name, disk) in &self.disks {
            if disk.device.is_empty() {
                return Err(VmError::Configuration(format!(
                    "disk `{name}` has an empty device"
                )));
            }
            if devices.contains(&disk.device.as_str()) {
                return Err(VmError::Configuration(format!(
                    "disk `{name}` reuses device `{}`",
                    disk.device
                )));
            }
            devices.push(&disk.device);
        }

        Ok(())
    }

    /// The network the primary MAC is bound to when none is recorded yet.
    pub fn default_primary_network(&self) -> Option<&str> {
        self.networks.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "vcpu": 2,
            "memorySize": 1024,
            "imageDir": "/var/lib/libvirt/images",
            "networks": ["default"],
        })
    }

    #[test]
    fn test_parse_minimal_applies_defaults() {
        let defn = Definition::parse(&minimal()).unwrap();
        assert_eq!(defn.vcpu, 2);
        assert_eq!(defn.memory_size, 1024);
        assert_eq!(defn.image_dir, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(defn.networks, vec!["default"]);
        assert!(!defn.headless);
        assert!(defn.extra_devices_xml.is_empty());
        assert!(defn.extra_domain_xml.is_empty());
        assert!(defn.disks.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let defn = Definition::from_json(
            r#"{
                "vcpu": 4,
                "memorySize": 2048,
                "extraDevicesXML": "<serial type='pty'/>",
                "extraDomainXML": "<clock offset='utc'/>",
                "headless": true,
                "imageDir": "/images",
                "networks": ["default", "isolated"],
                "disks": {
                    "data": { "device": "vdb", "size": 10240 },
                    "cache": { "device": "vdc", "size": 512, "baseImage": "/nix/store/c/disk.qcow2" }
                }
            }"#,
        )
        .unwrap();

        assert!(defn.headless);
        assert_eq!(defn.extra_devices_xml, "<serial type='pty'/>");
        assert_eq!(defn.networks.len(), 2);
        assert_eq!(defn.disks["data"].size, 10240);
        assert_eq!(defn.disks["data"].base_image, None);
        assert_eq!(
            defn.disks["cache"].base_image,
            Some(PathBuf::from("/nix/store/c/disk.qcow2"))
        );
        let names: Vec<&str> = defn.disks.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["cache", "data"]);
    }

    #[test]
    fn test_missing_required_fields() {
        for field in ["vcpu", "memorySize", "imageDir", "networks"] {
            let mut raw = minimal();
            raw.as_object_mut().unwrap().remove(field);
            let err = Definition::parse(&raw).unwrap_err();
            assert!(
                err.to_string().contains(field),
                "error for {field} was: {err}"
            );
        }
    }

    #[test]
    fn test_empty_networks_rejected() {
        let mut raw = minimal();
        raw["networks"] = json!([]);
        assert!(matches!(
            Definition::parse(&raw),
            Err(VmError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_image_dir_rejected() {
        let mut raw = minimal();
        raw["imageDir"] = json!("");
        assert!(matches!(
            Definition::parse(&raw),
            Err(VmError::Configuration(_))
        ));
    }

    #[test]
    fn test_disk_requires_device_and_size() {
        let mut raw = minimal();
        raw["disks"] = json!({ "data": { "size": 10 } });
        let err = Definition::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("disks.data.device"));

        raw["disks"] = json!({ "data": { "device": "vdb" } });
        let err = Definition::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("disks.data.size"));
    }

    #[test]
    fn test_disk_cannot_take_primary_device() {
        let mut raw = minimal();
        raw["disks"] = json!({ "data": { "device": "hda", "size": 10 } });
        assert!(Definition::parse(&raw).is_err());
    }

    #[test]
    fn test_zero_vcpu_rejected() {
        let mut raw = minimal();
        raw["vcpu"] = json!(0);
        assert!(Definition::parse(&raw).is_err());
    }

    #[test]
    fn test_wrong_type_is_configuration_error() {
        let mut raw = minimal();
        raw["vcpu"] = json!("two");
        assert!(matches!(
            Definition::parse(&raw),
            Err(VmError::Configuration(_))
        ));
    }
}
