//! Base image collaborator.
//!
//! Building images is not this crate's job; it asks an [`ImageBuilder`]
//! for a finished qcow2 file and provisions disks from it.

use crate::error::Result;
use async_trait::async_trait;
use kvmops_vm::{CommandRunner, HostCommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable carrying the client public key into the image build.
pub const PUBKEY_ENV: &str = "NIXOPS_LIBVIRTD_PUBKEY";

/// Name of the disk image inside an image build output.
pub const IMAGE_FILE: &str = "disk.qcow2";

/// Produces base images for the primary and extra disks.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the primary disk base image for `machine`, authorizing `public_key`.
    async fn base_image(&self, machine: &str, public_key: &str) -> Result<PathBuf>;

    /// Build an empty base image of `size` for extra disk `disk_name`.
    async fn extra_disk_image(&self, machine: &str, disk_name: &str, size: u64)
        -> Result<PathBuf>;
}

/// Builds images with `nix-build`.
pub struct NixImageBuilder {
    runner: Arc<dyn CommandRunner>,
    eval_args: Vec<String>,
    nix_path_args: Vec<String>,
    out_dir: PathBuf,
}

impl NixImageBuilder {
    /// `out_dir` receives the `-o` result symlinks.
    pub fn new(runner: Arc<dyn CommandRunner>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            eval_args: Vec::new(),
            nix_path_args: Vec::new(),
            out_dir: out_dir.into(),
        }
    }

    /// Arguments selecting the deployment expressions, e.g. the network files.
    pub fn eval_args(mut self, args: Vec<String>) -> Self {
        self.eval_args = args;
        self
    }

    /// `-I` arguments resolving `<nixops/...>` paths.
    pub fn nix_path_args(mut self, args: Vec<String>) -> Self {
        self.nix_path_args = args;
        self
    }

    fn out_link(&self, suffix: &str) -> String {
        self.out_dir
            .join(format!("libvirtd-image-{suffix}"))
            .display()
            .to_string()
    }
}

fn image_in(build_output: &str) -> PathBuf {
    Path::new(build_output.trim_end()).join(IMAGE_FILE)
}

#[async_trait]
impl ImageBuilder for NixImageBuilder {
    async fn base_image(&self, machine: &str, public_key: &str) -> Result<PathBuf> {
        tracing::info!(machine, "Building base image");
        let cmd = HostCommand::new("nix-build")
            .args(self.eval_args.iter().cloned())
            .args(["--arg", "checkConfigurationOptions", "false", "-A"])
            .arg(format!("nodes.{machine}.config.deployment.libvirtd.baseImage"))
            .arg("-o")
            .arg(self.out_link(machine))
            .env(PUBKEY_ENV, public_key);

        let output = self.runner.run(&cmd).await?;
        Ok(image_in(&output))
    }

    async fn extra_disk_image(
        &self,
        machine: &str,
        disk_name: &str,
        size: u64,
    ) -> Result<PathBuf> {
        tracing::info!(machine, disk = disk_name, size, "Building extra disk image");
        let cmd = HostCommand::new("nix-build")
            .args(self.nix_path_args.iter().cloned())
            .arg("<nixops/generate-ext4-image.nix>")
            .args(["--arg", "size"])
            .arg(size.to_string())
            .args(["--argstr", "name", disk_name])
            .arg("-o")
            .arg(self.out_link(&format!("{machine}-{disk_name}")));

        let output = self.runner.run(&cmd).await?;
        Ok(image_in(&output))
    }
}
