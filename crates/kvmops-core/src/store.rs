//! Identity persistence.
//!
//! The lifecycle controller reads the identity once when it opens a
//! machine and calls [`IdentityStore::save`] after every mutation.

use crate::error::{CoreError, Result};
use crate::identity::{MachineIdentity, MachineKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Key-value storage for machine identities.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load(&self, key: &MachineKey) -> Result<Option<MachineIdentity>>;
    async fn save(&self, key: &MachineKey, identity: &MachineIdentity) -> Result<()>;
    async fn remove(&self, key: &MachineKey) -> Result<()>;
}

/// Process-local store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<MachineKey, MachineIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored identities.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn load(&self, key: &MachineKey) -> Result<Option<MachineIdentity>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &MachineKey, identity: &MachineIdentity) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.clone(), identity.clone());
        Ok(())
    }

    async fn remove(&self, key: &MachineKey) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// One pretty-printed JSON file per machine under a state directory.
///
/// Writes go to a temporary sibling first and are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`: `{dir}/{deployment}-{name}.json`.
    pub fn path_for(&self, key: &MachineKey) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", key.deployment, key.name))
    }
}

#[async_trait]
impl IdentityStore for JsonFileStore {
    async fn load(&self, key: &MachineKey) -> Result<Option<MachineIdentity>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let identity = serde_json::from_slice(&bytes).map_err(|e| {
                    CoreError::Store(format!("corrupt identity file {}: {e}", path.display()))
                })?;
                Ok(Some(identity))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &MachineKey, identity: &MachineIdentity) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(identity)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(machine = %key, path = %path.display(), "Identity saved");
        Ok(())
    }

    async fn remove(&self, key: &MachineKey) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
