//! Controller configuration.

use crate::error::Result;
use kvmops_vm::{locate_emulator, LeaseWait, VmError, DEFAULT_CONNECT_URI, DEFAULT_EMULATOR};
use std::path::PathBuf;
use std::time::Duration;

/// Default prefix of registered domain names.
pub const DEFAULT_VM_ID_PREFIX: &str = "nixops";

/// Settings shared by every machine a controller manages.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// libvirt connection URI (default: `qemu:///system`).
    pub connect_uri: String,
    /// Prefix of the registered domain name (default: `nixops`).
    pub vm_id_prefix: String,
    /// Pinned emulator path. When unset, `emulator_binary` is looked up on `PATH`.
    pub emulator: Option<PathBuf>,
    /// Emulator binary name (default: `qemu-system-x86_64`).
    pub emulator_binary: String,
    /// Delay between DHCP lease lookups (default: 1 second).
    pub lease_poll_interval: Duration,
    /// Upper bound on the lease wait. `None` waits until cancelled.
    pub lease_timeout: Option<Duration>,
    /// Scratch directory for descriptor files and image build links.
    pub work_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_uri: DEFAULT_CONNECT_URI.into(),
            vm_id_prefix: DEFAULT_VM_ID_PREFIX.into(),
            emulator: None,
            emulator_binary: DEFAULT_EMULATOR.into(),
            lease_poll_interval: Duration::from_secs(1),
            lease_timeout: None,
            work_dir: std::env::temp_dir().join("kvmops"),
        }
    }
}

impl ControllerConfig {
    /// Create a new config builder.
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connect_uri.is_empty() {
            return Err(VmError::Configuration("connect_uri is required".into()).into());
        }
        if self.vm_id_prefix.is_empty() {
            return Err(VmError::Configuration("vm_id_prefix is required".into()).into());
        }
        if self.lease_poll_interval.is_zero() {
            return Err(
                VmError::Configuration("lease_poll_interval must be > 0".into()).into(),
            );
        }
        if self.lease_timeout.is_some_and(|t| t.is_zero()) {
            return Err(VmError::Configuration("lease_timeout must be > 0".into()).into());
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(VmError::Configuration("work_dir is required".into()).into());
        }
        Ok(())
    }

    /// Resolve the emulator path: the pinned path if set, else a `PATH` lookup.
    ///
    /// # Errors
    /// [`VmError::Precondition`] if the emulator cannot be found.
    pub fn resolve_emulator(&self) -> Result<PathBuf> {
        match &self.emulator {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(VmError::Precondition(format!(
                "emulator {} does not exist",
                path.display()
            ))
            .into()),
            None => Ok(locate_emulator(&self.emulator_binary)?),
        }
    }

    /// Polling policy for the DHCP lease wait.
    pub fn lease_wait(&self) -> LeaseWait {
        LeaseWait {
            interval: self.lease_poll_interval,
            timeout: self.lease_timeout,
        }
    }
}

/// Builder for ControllerConfig.
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    /// Set the libvirt connection URI.
    pub fn connect_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.connect_uri = uri.into();
        self
    }

    /// Set the domain name prefix.
    pub fn vm_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.vm_id_prefix = prefix.into();
        self
    }

    /// Pin the emulator path instead of searching `PATH`.
    pub fn emulator(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.emulator = Some(path.into());
        self
    }

    /// Set the emulator binary name searched on `PATH`.
    pub fn emulator_binary(mut self, name: impl Into<String>) -> Self {
        self.config.emulator_binary = name.into();
        self
    }

    /// Set the lease poll interval.
    pub fn lease_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lease_poll_interval = interval;
        self
    }

    /// Bound the lease wait.
    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.config.lease_timeout = Some(timeout);
        self
    }

    /// Set the scratch directory.
    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.work_dir = path.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ControllerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    #[test]
    fn test_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.connect_uri, "qemu:///system");
        assert_eq!(config.vm_id_prefix, "nixops");
        assert_eq!(config.emulator_binary, "qemu-system-x86_64");
        assert_eq!(config.lease_poll_interval, Duration::from_secs(1));
        assert!(config.lease_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_success() {
        let config = ControllerConfig::builder()
            .connect_uri("qemu:///session")
            .vm_id_prefix("lab")
            .lease_poll_interval(Duration::from_millis(250))
            .lease_timeout(Duration::from_secs(120))
            .work_dir("/tmp/kvmops-test")
            .build()
            .expect("should build successfully");

        assert_eq!(config.connect_uri, "qemu:///session");
        assert_eq!(config.vm_id_prefix, "lab");
        let wait = config.lease_wait();
        assert_eq!(wait.interval, Duration::from_millis(250));
        assert_eq!(wait.timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_builder_rejects_zero_interval() {
        let result = ControllerConfig::builder()
            .lease_poll_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = ControllerConfig::builder()
            .lease_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_pinned_emulator_must_exist() {
        let config = ControllerConfig::builder()
            .emulator("/nonexistent/qemu-system-x86_64")
            .build()
            .unwrap();
        assert!(matches!(
            config.resolve_emulator(),
            Err(CoreError::Vm(VmError::Precondition(_)))
        ));
    }

    #[test]
    fn test_emulator_lookup_by_binary_name() {
        let config = ControllerConfig::builder()
            .emulator_binary("kvmops-no-such-emulator")
            .build()
            .unwrap();
        assert_eq!(config.emulator_binary, "kvmops-no-such-emulator");
        assert!(matches!(
            config.resolve_emulator(),
            Err(CoreError::Vm(VmError::Precondition(_)))
        ));
    }

    #[test]
    fn test_pinned_emulator_used_as_is() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = ControllerConfig::builder()
            .emulator(file.path())
            .build()
            .unwrap();
        assert_eq!(config.resolve_emulator().unwrap(), file.path());
    }
}
