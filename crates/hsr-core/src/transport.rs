//! Collaborator contracts for the gateway and the signing backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::message::{
    InboundEnvelope, MessageStatus, PairDeviceRequest, PairDeviceResponse, ResponseEnvelope,
    VerifiedMessage,
};
use crate::types::{CertificateSet, DeviceIdentity, MsgId};

/// Default limit on any single collaborator call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The cloud gateway that delivers signing requests and receives results.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn pair_device(&self, request: &PairDeviceRequest) -> Result<PairDeviceResponse, TransportError>;

    /// Exchange the device's refresh token for a short-lived access token.
    async fn access_token(&self, identity: &DeviceIdentity) -> Result<String, TransportError>;

    async fn messages(&self, access_token: &str) -> Result<OneOrMany<InboundEnvelope>, TransportError>;

    async fn certificates(&self, access_token: &str) -> Result<CertificateSet, TransportError>;

    async fn acknowledge(&self, access_token: &str, msg_id: MsgId) -> Result<(), TransportError>;

    async fn broadcast(&self, access_token: &str, response: &ResponseEnvelope) -> Result<(), TransportError>;
}

/// The customer-operated, HSM-backed signing authority.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Submit verified messages; one status comes back per message it accepted.
    async fn submit(&self, messages: &[VerifiedMessage]) -> Result<Vec<MessageStatus>, TransportError>;

    /// Current status of each id the backend knows. Unknown ids are omitted.
    async fn query_status(&self, msg_ids: &[MsgId]) -> Result<Vec<MessageStatus>, TransportError>;
}

/// A JSON value that may be a single item or an array of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        OneOrMany::Many(items)
    }
}

/// Run a collaborator call, failing with [`TransportError::Timeout`] once
/// `limit` elapses.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_object_normalizes_to_sequence() {
        let one: OneOrMany<u32> = serde_json::from_str("5").unwrap();
        assert_eq!(one.into_vec(), vec![5]);
        let many: OneOrMany<u32> = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(many.into_vec(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let limit = Duration::from_secs(30);
        let result: Result<(), _> = with_timeout(limit, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TransportError::Timeout(limit)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(TransportError::BadResponse("nope".into()))
        })
        .await;
        assert_eq!(result, Err(TransportError::BadResponse("nope".into())));
    }
}
