//! Device pairing.
//!
//! A one-time pairing token, issued to the operator out of band, is traded
//! with the gateway for a durable [`DeviceIdentity`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use hsr_crypto::token;

use crate::errors::PairingError;
use crate::message::PairDeviceRequest;
use crate::store::{IdentityStore, StoreError};
use crate::transport::{with_timeout, Gateway};
use crate::types::DeviceIdentity;

#[derive(Deserialize)]
struct PairingClaims {
    #[serde(rename = "userId", default)]
    user_id: String,
}

/// The `userId` carried by a pairing token. The signature is not checked;
/// the token is a bearer credential that only the gateway can judge.
pub fn pairing_user_id(pairing_token: &str) -> Result<String, PairingError> {
    let claims: PairingClaims =
        token::decode_unverified(pairing_token).map_err(|e| PairingError::InvalidToken(e.to_string()))?;
    if claims.user_id.trim().is_empty() {
        return Err(PairingError::InvalidToken("token carries no userId".into()));
    }
    Ok(claims.user_id)
}

/// Structural check only: decodable and carrying a non-empty `userId`.
pub fn is_valid_pairing_token(pairing_token: &str) -> bool {
    pairing_user_id(pairing_token).is_ok()
}

/// Random 128-bit device id, hex encoded.
pub fn generate_device_id() -> Result<String, PairingError> {
    let mut b = [0u8; 16];
    getrandom::getrandom(&mut b).map_err(|e| PairingError::DeviceId(e.to_string()))?;
    Ok(hex::encode(b))
}

pub struct PairingManager {
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn IdentityStore>,
    timeout: Duration,
}

impl PairingManager {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<dyn IdentityStore>, timeout: Duration) -> Self {
        Self {
            gateway,
            store,
            timeout,
        }
    }

    /// Pair this device, replacing any identity already stored.
    pub async fn pair_device(&self, pairing_token: &str, device_id: &str) -> Result<DeviceIdentity, PairingError> {
        let user_id = pairing_user_id(pairing_token)?;
        let request = PairDeviceRequest {
            user_id: user_id.clone(),
            pairing_token: pairing_token.to_string(),
            device_id: device_id.to_string(),
        };

        let response = with_timeout(self.timeout, self.gateway.pair_device(&request))
            .await
            .map_err(|e| {
                warn!(user_id = %user_id, error = %e, "pairing request failed");
                PairingError::from(e)
            })?;

        let identity = DeviceIdentity {
            user_id,
            device_id: if response.device_id.is_empty() {
                device_id.to_string()
            } else {
                response.device_id
            },
            refresh_token: response.refresh_token,
        };
        self.store.save(&identity).await?;

        info!(user_id = %identity.user_id, device_id = %identity.device_id, "device paired");
        Ok(identity)
    }

    pub async fn is_paired(&self) -> Result<bool, StoreError> {
        Ok(self.store.load().await?.is_some())
    }

    pub async fn identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        self.store.load().await
    }

    pub async fn unpair(&self) -> Result<(), StoreError> {
        self.store.clear().await?;
        info!("device unpaired");
        Ok(())
    }
}
