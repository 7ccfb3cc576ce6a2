//! Per-service certificates used to verify signatures.
//!
//! The set is fetched lazily through a [`CertificateSource`] and shared
//! read-only between verifications. How long it stays valid is governed by
//! a [`RefreshPolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{TransportError, TrustError};
use crate::types::CertificateSet;

/// Where certificates come from; in production, the gateway.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch_certificates(&self) -> Result<CertificateSet, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Fetch once, keep until invalidated.
    #[default]
    Forever,
    /// Refetch once the cached set is older than this.
    Ttl(Duration),
}

struct CachedSet {
    set: Arc<CertificateSet>,
    fetched_at: Instant,
    invalidated: bool,
}

impl CachedSet {
    fn is_fresh(&self, policy: RefreshPolicy) -> bool {
        if self.invalidated {
            return false;
        }
        match policy {
            RefreshPolicy::Forever => true,
            RefreshPolicy::Ttl(ttl) => self.fetched_at.elapsed() < ttl,
        }
    }
}

pub struct TrustStore {
    source: Arc<dyn CertificateSource>,
    policy: RefreshPolicy,
    cache: RwLock<Option<CachedSet>>,
    // Serializes refreshes so concurrent callers share one fetch.
    refresh: Mutex<()>,
}

impl TrustStore {
    pub fn new(source: Arc<dyn CertificateSource>, policy: RefreshPolicy) -> Self {
        Self {
            source,
            policy,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// The current certificate set, fetching it if nothing fresh is cached.
    ///
    /// A failed refresh falls back to the stale set when there is one.
    pub async fn certificates(&self) -> Result<Arc<CertificateSet>, TrustError> {
        if let Some(set) = self.fresh().await {
            return Ok(set);
        }

        let _guard = self.refresh.lock().await;
        if let Some(set) = self.fresh().await {
            return Ok(set);
        }

        match self.source.fetch_certificates().await {
            Ok(set) => {
                info!(certificates = ?set.fingerprints(), "certificate set loaded");
                let set = Arc::new(set);
                *self.cache.write().await = Some(CachedSet {
                    set: set.clone(),
                    fetched_at: Instant::now(),
                    invalidated: false,
                });
                Ok(set)
            }
            Err(e) => match self.cache.read().await.as_ref() {
                Some(stale) => {
                    warn!(error = %e, "certificate refresh failed, serving cached set");
                    Ok(stale.set.clone())
                }
                None => Err(TrustError::CertificateUnavailable(e)),
            },
        }
    }

    /// PEM certificate registered under `service_key`.
    pub async fn certificate(&self, service_key: &str) -> Result<String, TrustError> {
        let set = self.certificates().await?;
        set.get(service_key)
            .map(str::to_owned)
            .ok_or_else(|| TrustError::CertificateMissing(service_key.to_string()))
    }

    /// Force the next lookup to refetch. The current set is kept as a
    /// fallback in case that fetch fails.
    pub async fn invalidate(&self) {
        if let Some(cached) = self.cache.write().await.as_mut() {
            debug!("certificate set invalidated");
            cached.invalidated = true;
        }
    }

    async fn fresh(&self) -> Option<Arc<CertificateSet>> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_fresh(self.policy))
            .map(|c| c.set.clone())
    }
}
