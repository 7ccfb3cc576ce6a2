//! Authenticated access to the gateway.
//!
//! Every gateway call needs a short-lived access token minted from the
//! persisted identity. [`GatewaySession`] keeps one cached until shortly
//! before it expires and drops it as soon as the gateway refuses it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hsr_crypto::token;

use crate::errors::TransportError;
use crate::message::{InboundEnvelope, ResponseEnvelope};
use crate::store::IdentityStore;
use crate::transport::{with_timeout, Gateway};
use crate::trust::CertificateSource;
use crate::types::{CertificateSet, DeviceIdentity, MsgId};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: u64 = 30;

struct CachedToken {
    identity: DeviceIdentity,
    token: String,
    expires_at: Option<u64>,
}

impl CachedToken {
    fn usable_for(&self, identity: &DeviceIdentity, now: u64) -> bool {
        self.identity == *identity
            && self
                .expires_at
                .map_or(true, |exp| now + EXPIRY_MARGIN_SECS < exp)
    }
}

pub struct GatewaySession {
    gateway: Arc<dyn Gateway>,
    identity: Arc<dyn IdentityStore>,
    timeout: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl GatewaySession {
    pub fn new(gateway: Arc<dyn Gateway>, identity: Arc<dyn IdentityStore>, timeout: Duration) -> Self {
        Self {
            gateway,
            identity,
            timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// A usable access token, minting a new one if needed.
    pub async fn access_token(&self) -> Result<String, TransportError> {
        let identity = self
            .identity
            .load()
            .await
            .map_err(|e| TransportError::Unavailable(format!("identity store: {e}")))?
            .ok_or(TransportError::NotPaired)?;

        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref().filter(|c| c.usable_for(&identity, unix_now())) {
            return Ok(c.token.clone());
        }

        let token = with_timeout(self.timeout, self.gateway.access_token(&identity)).await?;
        let expires_at = token::expires_at(&token);
        debug!(device_id = %identity.device_id, ?expires_at, "access token refreshed");
        *cached = Some(CachedToken {
            identity,
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    /// Forget the cached access token.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    pub async fn messages(&self) -> Result<Vec<InboundEnvelope>, TransportError> {
        let token = self.access_token().await?;
        let result = with_timeout(self.timeout, self.gateway.messages(&token)).await;
        Ok(self.observe(result).await?.into_vec())
    }

    pub async fn certificates(&self) -> Result<CertificateSet, TransportError> {
        let token = self.access_token().await?;
        let result = with_timeout(self.timeout, self.gateway.certificates(&token)).await;
        self.observe(result).await
    }

    pub async fn acknowledge(&self, msg_id: MsgId) -> Result<(), TransportError> {
        let token = self.access_token().await?;
        let result = with_timeout(self.timeout, self.gateway.acknowledge(&token, msg_id)).await;
        self.observe(result).await
    }

    pub async fn broadcast(&self, response: &ResponseEnvelope) -> Result<(), TransportError> {
        let token = self.access_token().await?;
        let result = with_timeout(self.timeout, self.gateway.broadcast(&token, response)).await;
        self.observe(result).await
    }

    async fn observe<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_rejection() {
                warn!(error = %e, "gateway rejected access token");
                self.invalidate().await;
            }
        }
        result
    }
}

#[async_trait]
impl CertificateSource for GatewaySession {
    async fn fetch_certificates(&self) -> Result<CertificateSet, TransportError> {
        self.certificates().await
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
