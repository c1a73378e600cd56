//! libvirt domain descriptor generation.
//!
//! [`DomainDescriptor`] collects typed elements and only turns them into
//! XML text in [`DomainDescriptor::render`]. Element order inside
//! `<devices>` is fixed: emulator, disks, interfaces, graphics, inputs,
//! then the raw extra-devices fragment.
//!
//! The two raw fragments (`extraDevicesXML`, `extraDomainXML`) are inserted
//! verbatim. They come from the operator's own configuration and are
//! trusted the same way the rest of that configuration is; generated values
//! are escaped.

use crate::definition::{Definition, PRIMARY_DISK_DEVICE};
use crate::disk::ExtraDisk;
use crate::error::{Result, VmError};
use crate::network::MacAddress;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Emulator binary looked up on `PATH` when none is configured.
pub const DEFAULT_EMULATOR: &str = "qemu-system-x86_64";

/// Locate the emulator binary on `PATH`.
///
/// # Errors
/// [`VmError::Precondition`] if the binary cannot be found.
pub fn locate_emulator(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|e| {
        VmError::Precondition(format!(
            "{binary} executable not found ({e}). Please install QEMU first."
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskElement {
    pub source: PathBuf,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceElement {
    pub network: String,
    pub mac: Option<MacAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsElement {
    pub kind: String,
    pub display: String,
}

impl Default for GraphicsElement {
    fn default() -> Self {
        Self {
            kind: "sdl".into(),
            display: ":0.0".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputElement {
    Keyboard,
    Mouse,
}

impl InputElement {
    fn kind(self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Mouse => "mouse",
        }
    }
}

/// Structured form of a KVM domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    name: String,
    memory_mib: u64,
    vcpu: u32,
    arch: String,
    emulator: PathBuf,
    disks: Vec<DiskElement>,
    interfaces: Vec<InterfaceElement>,
    graphics: Option<GraphicsElement>,
    inputs: Vec<InputElement>,
    extra_devices: String,
    extra_domain: String,
}

impl DomainDescriptor {
    /// Start a descriptor for domain `name` run by `emulator`.
    pub fn new(name: impl Into<String>, emulator: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            memory_mib: 0,
            vcpu: 1,
            arch: "x86_64".into(),
            emulator: emulator.into(),
            disks: Vec::new(),
            interfaces: Vec::new(),
            graphics: None,
            inputs: Vec::new(),
            extra_devices: String::new(),
            extra_domain: String::new(),
        }
    }

    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.memory_mib = mib;
        self
    }

    /// vCPU count; the topology is one socket with `count` single-threaded cores.
    pub fn vcpu(mut self, count: u32) -> Self {
        self.vcpu = count;
        self
    }

    /// Attach a qcow2 file disk at `target`.
    pub fn disk(mut self, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.disks.push(DiskElement {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Attach a virtio NIC on `network`, optionally with a fixed MAC.
    pub fn interface(mut self, network: impl Into<String>, mac: Option<MacAddress>) -> Self {
        self.interfaces.push(InterfaceElement {
            network: network.into(),
            mac,
        });
        self
    }

    pub fn graphics(mut self, graphics: GraphicsElement) -> Self {
        self.graphics = Some(graphics);
        self
    }

    pub fn input(mut self, input: InputElement) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn extra_devices(mut self, xml: impl Into<String>) -> Self {
        self.extra_devices = xml.into();
        self
    }

    pub fn extra_domain(mut self, xml: impl Into<String>) -> Self {
        self.extra_domain = xml.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disks(&self) -> &[DiskElement] {
        &self.disks
    }

    pub fn interfaces(&self) -> &[InterfaceElement] {
        &self.interfaces
    }

    pub fn has_graphics(&self) -> bool {
        self.graphics.is_some()
    }

    /// Render the descriptor as libvirt domain XML.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, r#"<domain type="kvm">"#)?;
        writeln!(out, "  <name>{}</name>", escape(&self.name))?;
        writeln!(out, r#"  <memory unit="MiB">{}</memory>"#, self.memory_mib)?;
        writeln!(out, "  <vcpu>{}</vcpu>", self.vcpu)?;
        writeln!(out, "  <cpu>")?;
        writeln!(
            out,
            r#"    <topology sockets="1" cores="{}" threads="1"/>"#,
            self.vcpu
        )?;
        writeln!(out, "  </cpu>")?;
        writeln!(out, "  <os>")?;
        writeln!(out, r#"    <type arch="{}">hvm</type>"#, escape(&self.arch))?;
        writeln!(out, "  </os>")?;
        writeln!(out, "  <devices>")?;
        writeln!(
            out,
            "    <emulator>{}</emulator>",
            escape(&self.emulator.display().to_string())
        )?;

        for disk in &self.disks {
            writeln!(out, r#"    <disk type="file" device="disk">"#)?;
            writeln!(out, r#"      <driver name="qemu" type="qcow2"/>"#)?;
            writeln!(
                out,
                r#"      <source file="{}"/>"#,
                escape(&disk.source.display().to_string())
            )?;
            writeln!(out, r#"      <target dev="{}"/>"#, escape(&disk.target))?;
            writeln!(out, "    </disk>")?;
        }

        for iface in &self.interfaces {
            writeln!(out, r#"    <interface type="network">"#)?;
            if let Some(mac) = &iface.mac {
                writeln!(out, r#"      <mac address="{mac}"/>"#)?;
            }
            writeln!(out, r#"      <source network="{}"/>"#, escape(&iface.network))?;
            writeln!(out, r#"      <model type="virtio"/>"#)?;
            writeln!(out, "    </interface>")?;
        }

        if let Some(graphics) = &self.graphics {
            writeln!(
                out,
                r#"    <graphics type="{}" display="{}"/>"#,
                escape(&graphics.kind),
                escape(&graphics.display)
            )?;
        }

        for input in &self.inputs {
            writeln!(out, r#"    <input type="{}" bus="usb"/>"#, input.kind())?;
        }

        if !self.extra_devices.is_empty() {
            writeln!(out, "{}", self.extra_devices)?;
        }
        writeln!(out, "  </devices>")?;
        if !self.extra_domain.is_empty() {
            writeln!(out, "{}", self.extra_domain)?;
        }
        writeln!(out, "</domain>")
    }
}

/// The identity-derived inputs of a domain descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DomainIdentity<'a> {
    pub vm_id: &'a str,
    pub disk_path: &'a Path,
    pub primary_net: &'a str,
    pub primary_mac: &'a MacAddress,
    pub extra_disks: &'a BTreeMap<String, ExtraDisk>,
}

/// Build the descriptor for `definition` under `identity`.
///
/// Pure: identical inputs give identical descriptors.
pub fn build_domain(
    definition: &Definition,
    identity: DomainIdentity<'_>,
    emulator: &Path,
) -> DomainDescriptor {
    let mut descriptor = DomainDescriptor::new(identity.vm_id, emulator)
        .memory_mib(definition.memory_size)
        .vcpu(definition.vcpu)
        .disk(identity.disk_path, PRIMARY_DISK_DEVICE);

    for disk in identity.extra_disks.values() {
        descriptor = descriptor.disk(&disk.image_path, &disk.device);
    }

    for network in &definition.networks {
        let mac = (network == identity.primary_net).then_some(*identity.primary_mac);
        descriptor = descriptor.interface(network, mac);
    }

    if !definition.headless {
        descriptor = descriptor.graphics(GraphicsElement::default());
    }

    descriptor
        .input(InputElement::Keyboard)
        .input(InputElement::Mouse)
        .extra_devices(&definition.extra_devices_xml)
        .extra_domain(&definition.extra_domain_xml)
}

/// Render the domain XML for `definition` under `identity`.
pub fn render_domain(
    definition: &Definition,
    identity: DomainIdentity<'_>,
    emulator: &Path,
) -> String {
    build_domain(definition, identity, emulator).render()
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
