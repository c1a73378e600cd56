//! Disk image provisioning under the machine's image directory.

use crate::command::{CommandRunner, HostCommand};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File mode for provisioned disks: owner and group read/write.
pub const DISK_MODE: u32 = 0o660;

/// Image path of the primary disk: `{image_dir}/{vm_id}.img`.
pub fn primary_disk_path(image_dir: &Path, vm_id: &str) -> PathBuf {
    image_dir.join(format!("{vm_id}.img"))
}

/// Image path of an extra disk: `{image_dir}/{vm_id}-{disk_name}.img`.
pub fn extra_disk_path(image_dir: &Path, vm_id: &str, disk_name: &str) -> PathBuf {
    image_dir.join(format!("{vm_id}-{disk_name}.img"))
}

/// A provisioned extra disk as recorded in the machine identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraDisk {
    /// Guest target device, e.g. `vdb`
    pub device: String,
    /// Overlay image on the host
    pub image_path: PathBuf,
}

/// Materializes disk images with `qemu-img`.
#[derive(Clone)]
pub struct DiskProvisioner {
    runner: Arc<dyn CommandRunner>,
}

impl DiskProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Copy `base_image` to `dest` and detach it from its backing chain.
    ///
    /// The copy is rebased onto an empty backing file so it keeps working
    /// after the base image is garbage collected.
    pub async fn provision_primary(&self, base_image: &Path, dest: &Path) -> Result<()> {
        tracing::info!(
            base = %base_image.display(),
            dest = %dest.display(),
            "Provisioning primary disk"
        );

        let bytes = tokio::fs::copy(base_image, dest).await?;
        // The copy inherits the (usually read-only) mode of the base image.
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(DISK_MODE)).await?;

        self.runner
            .run(
                &HostCommand::new("qemu-img")
                    .args(["rebase", "-f", "qcow2", "-b", ""])
                    .arg(dest.display().to_string()),
            )
            .await?;

        tracing::debug!(dest = %dest.display(), bytes, "Primary disk ready");
        Ok(())
    }

    /// Create a copy-on-write qcow2 overlay of `base_image` at `dest`.
    pub async fn provision_extra(&self, base_image: &Path, dest: &Path) -> Result<()> {
        tracing::info!(
            base = %base_image.display(),
            dest = %dest.display(),
            "Provisioning extra disk"
        );

        self.runner
            .run(
                &HostCommand::new("qemu-img")
                    .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
                    .arg(base_image.display().to_string())
                    .arg(dest.display().to_string()),
            )
            .await?;
        Ok(())
    }

    /// Delete a disk image if it exists. Returns whether a file was removed.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed disk image");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Disk image already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;

    #[test]
    fn test_disk_paths() {
        let dir = Path::new("/var/lib/libvirt/images");
        assert_eq!(
            primary_disk_path(dir, "nixops-1234-web"),
            PathBuf::from("/var/lib/libvirt/images/nixops-1234-web.img")
        );
        assert_eq!(
            extra_disk_path(dir, "nixops-1234-web", "data"),
            PathBuf::from("/var/lib/libvirt/images/nixops-1234-web-data.img")
        );
    }

    #[test]
    fn test_extra_disk_serializes_camel_case() {
        let disk = ExtraDisk {
            device: "vdb".into(),
            image_path: PathBuf::from("/images/x-data.img"),
        };
        let json = serde_json::to_value(&disk).unwrap();
        assert_eq!(json["imagePath"], "/images/x-data.img");
        assert_eq!(json["device"], "vdb");
    }

    #[tokio::test]
    async fn test_provision_primary_copies_rebases_and_restricts_mode() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("disk.qcow2");
        std::fs::write(&base, b"qcow2-bytes").unwrap();
        std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o444)).unwrap();
        let dest = dir.path().join("vm.img");

        let runner = Arc::new(ScriptedRunner::new());
        let disks = DiskProvisioner::new(runner.clone());
        disks.provision_primary(&base, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"qcow2-bytes");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, DISK_MODE);
        assert_eq!(
            runner.calls()[0].to_string(),
            format!("qemu-img rebase -f qcow2 -b \"\" {}", dest.display())
        );
    }

    #[tokio::test]
    async fn test_provision_primary_surfaces_rebase_failure() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("disk.qcow2");
        std::fs::write(&base, b"qcow2-bytes").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("rebase", "Could not open image");
        let disks = DiskProvisioner::new(runner);

        let err = disks
            .provision_primary(&base, &dir.path().join("vm.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::VmError::ExternalTool { .. }));
    }

    #[tokio::test]
    async fn test_provision_extra_is_backed_overlay() {
        let runner = Arc::new(ScriptedRunner::new());
        let disks = DiskProvisioner::new(runner.clone());
        disks
            .provision_extra(Path::new("/nix/store/x/disk.qcow2"), Path::new("/images/vm-data.img"))
            .await
            .unwrap();

        assert_eq!(
            runner.calls()[0].to_string(),
            "qemu-img create -f qcow2 -F qcow2 -b /nix/store/x/disk.qcow2 /images/vm-data.img"
        );
    }

    #[tokio::test]
    async fn test_remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.img");
        std::fs::write(&path, b"x").unwrap();
        let disks = DiskProvisioner::new(Arc::new(ScriptedRunner::new()));

        assert!(disks.remove(&path).await.unwrap());
        assert!(!path.exists());
        assert!(!disks.remove(&path).await.unwrap());
    }
}
