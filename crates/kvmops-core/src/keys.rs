//! Client SSH key pair generation.

use crate::error::Result;
use crate::identity::SshKeyPair;
use async_trait::async_trait;
use kvmops_vm::{CommandRunner, HostCommand};
use std::sync::Arc;

/// Produces a fresh client key pair.
#[async_trait]
pub trait KeyPairSource: Send + Sync {
    async fn generate(&self) -> Result<SshKeyPair>;
}

/// Generates ed25519 keys with `ssh-keygen` in a scratch directory.
pub struct SshKeygen {
    runner: Arc<dyn CommandRunner>,
    comment: String,
}

impl SshKeygen {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            comment: "kvmops".into(),
        }
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

#[async_trait]
impl KeyPairSource for SshKeygen {
    async fn generate(&self) -> Result<SshKeyPair> {
        let scratch = tempfile::tempdir()?;
        let key_file = scratch.path().join("id_ed25519");

        self.runner
            .run(
                &HostCommand::new("ssh-keygen")
                    .args(["-q", "-t", "ed25519", "-N", "", "-C"])
                    .arg(self.comment.as_str())
                    .arg("-f")
                    .arg(key_file.display().to_string()),
            )
            .await?;

        let private_key = tokio::fs::read_to_string(&key_file).await?;
        let public_key = tokio::fs::read_to_string(key_file.with_extension("pub")).await?;
        tracing::debug!("Generated client key pair");

        Ok(SshKeyPair {
            public_key: public_key.trim().to_string(),
            private_key,
        })
    }
}
