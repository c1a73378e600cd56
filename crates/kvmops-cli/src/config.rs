//! Configuration for the `kvmops` binary.
//!
//! Loaded from environment variables with defaults, then overridden by
//! command-line flags.

use kvmops_core::ControllerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding one identity file per machine.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/kvmops";

/// Settings of one `kvmops` invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Directory of the JSON identity store.
    pub state_dir: PathBuf,

    /// libvirt connection URI.
    pub connect_uri: String,

    /// Upper bound on the DHCP lease wait (default: wait until interrupted).
    pub lease_timeout: Option<Duration>,

    /// Pinned emulator path (default: looked up on `PATH`).
    pub emulator: Option<PathBuf>,

    /// Scratch directory for descriptors and image build links.
    pub work_dir: PathBuf,

    /// Arguments selecting the deployment expressions for `nix-build`.
    /// Split on whitespace, so no single argument may contain a space.
    pub nix_args: Vec<String>,

    /// Nix search path entries, passed as `-I <entry>`.
    pub nix_path: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            connect_uri: controller.connect_uri,
            lease_timeout: controller.lease_timeout,
            emulator: controller.emulator,
            work_dir: controller.work_dir,
            nix_args: Vec::new(),
            nix_path: Vec::new(),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KVMOPS_STATE_DIR` | `/var/lib/kvmops` |
    /// | `KVMOPS_CONNECT_URI` | `qemu:///system` |
    /// | `KVMOPS_LEASE_TIMEOUT_SECS` | unset (no timeout) |
    /// | `KVMOPS_EMULATOR` | unset (`PATH` lookup) |
    /// | `KVMOPS_WORK_DIR` | `$TMPDIR/kvmops` |
    /// | `KVMOPS_NIX_ARGS` | empty, whitespace separated |
    /// | `KVMOPS_NIX_PATH` | empty, colon separated |
    ///
    /// `KVMOPS_NIX_ARGS` is not shell-parsed: quoting is not honoured, so an
    /// argument containing whitespace cannot be passed through it.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            state_dir: std::env::var("KVMOPS_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            connect_uri: std::env::var("KVMOPS_CONNECT_URI").unwrap_or(default.connect_uri),
            lease_timeout: std::env::var("KVMOPS_LEASE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| parse_timeout(&v))
                .or(default.lease_timeout),
            emulator: std::env::var("KVMOPS_EMULATOR")
                .ok()
                .map(PathBuf::from)
                .or(default.emulator),
            work_dir: std::env::var("KVMOPS_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.work_dir),
            nix_args: std::env::var("KVMOPS_NIX_ARGS")
                .map(|v| split_args(&v))
                .unwrap_or(default.nix_args),
            nix_path: std::env::var("KVMOPS_NIX_PATH")
                .map(|v| split_search_path(&v))
                .unwrap_or(default.nix_path),
        }
    }

    /// Controller settings derived from this configuration.
    pub fn controller(&self) -> kvmops_core::Result<ControllerConfig> {
        let mut builder = ControllerConfig::builder()
            .connect_uri(self.connect_uri.as_str())
            .work_dir(&self.work_dir);
        if let Some(timeout) = self.lease_timeout {
            builder = builder.lease_timeout(timeout);
        }
        if let Some(emulator) = &self.emulator {
            builder = builder.emulator(emulator);
        }
        builder.build()
    }

    /// `-I` arguments for `nix-build`.
    pub fn nix_path_args(&self) -> Vec<String> {
        self.nix_path
            .iter()
            .flat_map(|entry| ["-I".to_string(), entry.clone()])
            .collect()
    }
}

/// Seconds to a timeout; `0` or garbage means no timeout.
fn parse_timeout(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn split_search_path(value: &str) -> Vec<String> {
    value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
