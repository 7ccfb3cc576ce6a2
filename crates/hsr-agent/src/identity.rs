//! File-backed device identity.
//!
//! The identity is stored as a small JSON document. Saves go to a sibling
//! temp file that is renamed over the target, so a crash mid-write leaves
//! either the old identity or the new one on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hsr_core::store::{IdentityStore, StoreError};
use hsr_core::DeviceIdentity;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct FileIdentityStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::OperationFailed(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };

        let identity: DeviceIdentity = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::DataCorruption(format!("{}: {e}", self.path.display()))
        })?;
        debug!(device_id = %identity.device_id, "identity loaded");
        Ok(Some(identity))
    }

    async fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(identity)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        }

        let tmp = self.temp_path();
        write_private(&tmp, &data)
            .await
            .map_err(|e| StoreError::OperationFailed(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::OperationFailed(format!("replacing {}: {e}", self.path.display())))?;

        info!(path = %self.path.display(), device_id = %identity.device_id, "identity saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "identity removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::OperationFailed(e.to_string())),
        }
    }
}

async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}
