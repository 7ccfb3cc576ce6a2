//! Persistence of the paired device identity.
//!
//! The `IdentityStore` trait is the only contract the core needs; the agent
//! binary provides a file-backed implementation.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::DeviceIdentity;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load(&self) -> Result<Option<DeviceIdentity>, StoreError>;

    /// Replace the stored identity. Readers see either the old or the new
    /// identity, never a mix.
    async fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory identity store for tests and embedding.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    identity: RwLock<Option<DeviceIdentity>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: DeviceIdentity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn load(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        Ok(self.identity.read().await.clone())
    }

    async fn save(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        *self.identity.write().await = Some(identity.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.identity.write().await = None;
        Ok(())
    }
}
