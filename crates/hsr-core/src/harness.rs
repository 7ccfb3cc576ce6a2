//! Test harness for HSR core functionality.
//!
//! Fixture keys and certificates, builders for correctly (and incorrectly)
//! signed messages, and in-memory gateway and signing backend doubles. Used
//! by the unit tests, the integration tests, and the agent crate's tests.
//! Compiled only for tests or with the `test-util` feature.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use hsr_crypto::signature::sign_payload;
use hsr_crypto::{token, CryptoError, PrivateKey, SignatureEncoding};

use crate::agent::PairingPrompt;
use crate::errors::{PairingError, TransportError};
use crate::message::{
    Envelope, InboundEnvelope, MessageMetadata, MessageStatus, PairDeviceRequest, PairDeviceResponse,
    ResponseEnvelope, SignatureInfo, SignedMessage, SigningState, TransportMetadata, VerifiedMessage,
};
use crate::policy::{self, SignatureSource};
use crate::transport::{Gateway, OneOrMany, SigningBackend};
use crate::types::{CertificateSet, DeviceIdentity, MsgId};

// ============================================================================
// Fixture keys
// ============================================================================

/// Key pairs standing in for the services that sign relay traffic.
///
/// `GatewayBroker` and `ConfigurationManager` are RSA-2048; `VaultService`
/// and `PolicyService` are P-256. `Rogue` is an RSA key no trust set knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKey {
    GatewayBroker,
    VaultService,
    PolicyService,
    ConfigurationManager,
    Rogue,
}

impl FixtureKey {
    pub fn signing_service_id(self) -> &'static str {
        match self {
            FixtureKey::GatewayBroker => "ZSERVICE",
            FixtureKey::VaultService => "VAULT_SERVICE",
            FixtureKey::PolicyService => "POLICY_SERVICE",
            FixtureKey::ConfigurationManager => "CONFIGURATION_MANAGER",
            FixtureKey::Rogue => "ROGUE_SERVICE",
        }
    }

    pub fn certificate_pem(self) -> &'static str {
        match self {
            FixtureKey::GatewayBroker => include_str!("../testdata/zs_cert.pem"),
            FixtureKey::VaultService => include_str!("../testdata/vs_cert.pem"),
            FixtureKey::PolicyService => include_str!("../testdata/ps_cert.pem"),
            FixtureKey::ConfigurationManager => include_str!("../testdata/cm_cert.pem"),
            FixtureKey::Rogue => include_str!("../testdata/rogue_cert.pem"),
        }
    }

    pub fn private_key_pem(self) -> &'static str {
        match self {
            FixtureKey::GatewayBroker => include_str!("../testdata/zs_key.pem"),
            FixtureKey::VaultService => include_str!("../testdata/vs_key.pem"),
            FixtureKey::PolicyService => include_str!("../testdata/ps_key.pem"),
            FixtureKey::ConfigurationManager => include_str!("../testdata/cm_key.pem"),
            FixtureKey::Rogue => include_str!("../testdata/rogue_key.pem"),
        }
    }

    pub fn private_key(self) -> Result<PrivateKey, CryptoError> {
        PrivateKey::from_pem(self.private_key_pem())
    }
}

/// Trust set with every fixture service except `Rogue`.
pub fn fixture_certificates() -> CertificateSet {
    [
        FixtureKey::GatewayBroker,
        FixtureKey::VaultService,
        FixtureKey::PolicyService,
        FixtureKey::ConfigurationManager,
    ]
    .into_iter()
    .map(|k| (crate::types::certificate_key(k.signing_service_id()), k.certificate_pem()))
    .collect()
}

pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity {
        user_id: "user-1".into(),
        device_id: "device-1".into(),
        refresh_token: "refresh-1".into(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A pairing token for `user_id`, signed by the gateway broker.
pub fn pairing_token(user_id: &str) -> Result<String, CryptoError> {
    let key = FixtureKey::GatewayBroker.private_key()?;
    token::encode_signed(&json!({"userId": user_id, "exp": unix_now() + 600}), &key)
}

// ============================================================================
// Message builders
// ============================================================================

struct MetadataSpec {
    payload: Value,
    policy_signer: Option<FixtureKey>,
}

/// Builds a [`SignedMessage`] signed the way the policy table expects,
/// with knobs for breaking it.
pub struct MessageBuilder {
    message_type: String,
    payload: Value,
    signer: FixtureKey,
    declared_signer: Option<String>,
    metadata: Option<MetadataSpec>,
}

impl MessageBuilder {
    pub fn new(message_type: impl Into<String>, payload: Value, signer: FixtureKey) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            signer,
            declared_signer: None,
            metadata: None,
        }
    }

    pub fn legacy_proof_of_ownership(request_id: &str) -> Self {
        Self::new(
            policy::EXTERNAL_KEY_PROOF_OF_OWNERSHIP,
            json!({"requestId": request_id, "publicKey": "04a1b2c3"}),
            FixtureKey::ConfigurationManager,
        )
    }

    pub fn proof_of_ownership(request_id: &str, version: Option<Value>) -> Self {
        let mut payload = json!({"requestId": request_id, "keyId": "key-7", "challenge": "6e6f6e6365"});
        if let (Some(version), Some(map)) = (version, payload.as_object_mut()) {
            map.insert("version".into(), version);
        }
        Self::new(policy::KEY_LINK_PROOF_OF_OWNERSHIP, payload, FixtureKey::VaultService)
    }

    pub fn tx_sign(tx_id: &str) -> Self {
        let mut builder = Self::new(
            policy::KEY_LINK_TX_SIGN,
            json!({"txId": tx_id, "asset": "BTC", "amount": "0.25", "destination": "bc1qexample"}),
            FixtureKey::VaultService,
        );
        builder.metadata = Some(MetadataSpec {
            payload: json!({"txId": tx_id, "decision": "APPROVED"}),
            policy_signer: Some(FixtureKey::PolicyService),
        });
        builder
    }

    /// Sign the primary payload with `key`, declaring `key`'s service id.
    pub fn signed_by(mut self, key: FixtureKey) -> Self {
        self.signer = key;
        self
    }

    /// Declare `signing_service_id` regardless of the key actually used.
    pub fn declared_signer(mut self, signing_service_id: &str) -> Self {
        self.declared_signer = Some(signing_service_id.to_string());
        self
    }

    /// Sign the metadata with `key` while still declaring the policy service.
    pub fn policy_signed_by(mut self, key: FixtureKey) -> Self {
        if let Some(metadata) = self.metadata.as_mut() {
            metadata.policy_signer = Some(key);
        }
        self
    }

    /// Keep the metadata block but leave out the policy signature.
    pub fn without_policy_signature(mut self) -> Self {
        if let Some(metadata) = self.metadata.as_mut() {
            metadata.policy_signer = None;
        }
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }

    pub fn build(&self) -> Result<SignedMessage, CryptoError> {
        let payload = self.payload.to_string();
        let signature = sign_payload(
            &self.signer.private_key()?,
            payload.as_bytes(),
            self.encoding_for(SignatureSource::Primary),
        )?;

        let metadata = match &self.metadata {
            None => None,
            Some(spec) => {
                let metadata_payload = spec.payload.to_string();
                let mut signature_info = Vec::new();
                if let Some(key) = spec.policy_signer {
                    let encoding = self.encoding_for(SignatureSource::Metadata {
                        signer: FixtureKey::PolicyService.signing_service_id(),
                    });
                    signature_info.push(SignatureInfo {
                        signing_service_id: FixtureKey::PolicyService.signing_service_id().into(),
                        signature: sign_payload(&key.private_key()?, metadata_payload.as_bytes(), encoding)?,
                    });
                }
                Some(MessageMetadata {
                    payload: metadata_payload,
                    signature_info,
                })
            }
        };

        Ok(SignedMessage {
            message_type: self.message_type.clone(),
            payload,
            signature_info: SignatureInfo {
                signing_service_id: self
                    .declared_signer
                    .clone()
                    .unwrap_or_else(|| self.signer.signing_service_id().to_string()),
                signature,
            },
            metadata,
        })
    }

    fn encoding_for(&self, source: SignatureSource) -> SignatureEncoding {
        policy::policy_for(&self.message_type)
            .and_then(|p| p.checks.iter().find(|c| c.signature == source))
            .map(|c| c.encoding)
            .unwrap_or(SignatureEncoding::Base64)
    }
}

fn envelope(msg_id: MsgId, inner: Envelope) -> InboundEnvelope {
    InboundEnvelope {
        msg_id,
        device_id: "device-1".into(),
        internal_message_id: format!("internal-{msg_id}"),
        envelope: inner,
    }
}

/// Wrap an already-decoded message.
pub fn structured_envelope(msg_id: MsgId, message: &SignedMessage) -> InboundEnvelope {
    let map = match serde_json::to_value(message) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    envelope(msg_id, Envelope::Structured(map))
}

/// Wrap a message as a token signed by `broker`.
pub fn encoded_envelope(
    msg_id: MsgId,
    message: &SignedMessage,
    broker: FixtureKey,
) -> Result<InboundEnvelope, CryptoError> {
    let jws = token::encode_signed(message, &broker.private_key()?)?;
    Ok(envelope(msg_id, Envelope::Encoded(jws)))
}

pub fn verified_message(msg_id: MsgId, message_type: &str, message: Value) -> VerifiedMessage {
    VerifiedMessage {
        transport_metadata: TransportMetadata {
            msg_id,
            device_id: "device-1".into(),
            internal_message_id: format!("internal-{msg_id}"),
            message_type: message_type.into(),
        },
        message,
        verified_by: Vec::new(),
    }
}

// ============================================================================
// Mock gateway
// ============================================================================

/// In-memory gateway. Delivered envelopes are returned by every
/// `messages` call until acknowledged.
#[derive(Default)]
pub struct MockGateway {
    certificates: Mutex<CertificateSet>,
    inbox: Mutex<Vec<InboundEnvelope>>,
    acknowledged: Mutex<Vec<MsgId>>,
    broadcasts: Mutex<Vec<ResponseEnvelope>>,
    pair_requests: Mutex<Vec<PairDeviceRequest>>,
    rejected_tokens: Mutex<HashSet<String>>,
    current_token: Mutex<Option<String>>,
    reject_pairing: AtomicBool,
    fail_broadcasts: AtomicBool,
    offline: AtomicBool,
    single_object: AtomicBool,
    tokens_issued: AtomicUsize,
    certificate_fetches: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture_certificates() -> Self {
        Self {
            certificates: Mutex::new(fixture_certificates()),
            ..Self::default()
        }
    }

    pub async fn set_certificates(&self, certificates: CertificateSet) {
        *self.certificates.lock().await = certificates;
    }

    pub async fn deliver(&self, envelope: InboundEnvelope) {
        self.inbox.lock().await.push(envelope);
    }

    pub fn reject_pairing(&self, reject: bool) {
        self.reject_pairing.store(reject, Ordering::SeqCst);
    }

    pub async fn reject_pairing_tokens(&self, tokens: impl IntoIterator<Item = String>) {
        self.rejected_tokens.lock().await.extend(tokens);
    }

    pub fn fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer a single pending envelope as a bare object instead of an array.
    pub fn answer_single_as_object(&self, single: bool) {
        self.single_object.store(single, Ordering::SeqCst);
    }

    /// Invalidate every access token handed out so far.
    pub async fn revoke_access_tokens(&self) {
        *self.current_token.lock().await = None;
    }

    pub async fn pair_requests(&self) -> Vec<PairDeviceRequest> {
        self.pair_requests.lock().await.clone()
    }

    pub async fn acknowledged(&self) -> Vec<MsgId> {
        self.acknowledged.lock().await.clone()
    }

    pub async fn broadcasts(&self) -> Vec<ResponseEnvelope> {
        self.broadcasts.lock().await.clone()
    }

    pub async fn inbox_len(&self) -> usize {
        self.inbox.lock().await.len()
    }

    pub fn tokens_issued(&self) -> usize {
        self.tokens_issued.load(Ordering::SeqCst)
    }

    pub fn certificate_fetches(&self) -> usize {
        self.certificate_fetches.load(Ordering::SeqCst)
    }

    async fn authorize(&self, access_token: &str) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("gateway offline".into()));
        }
        match self.current_token.lock().await.as_deref() {
            Some(current) if current == access_token => Ok(()),
            _ => Err(TransportError::Rejected {
                status: 401,
                reason: "access token expired".into(),
            }),
        }
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn pair_device(&self, request: &PairDeviceRequest) -> Result<PairDeviceResponse, TransportError> {
        self.pair_requests.lock().await.push(request.clone());
        if self.reject_pairing.load(Ordering::SeqCst)
            || self.rejected_tokens.lock().await.contains(&request.pairing_token)
        {
            return Err(TransportError::Rejected {
                status: 401,
                reason: "pairing token rejected".into(),
            });
        }
        Ok(PairDeviceResponse {
            refresh_token: format!("refresh-{}", request.user_id),
            device_id: request.device_id.clone(),
        })
    }

    async fn access_token(&self, _identity: &DeviceIdentity) -> Result<String, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("gateway offline".into()));
        }
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("access-token-{n}");
        *self.current_token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn messages(&self, access_token: &str) -> Result<OneOrMany<InboundEnvelope>, TransportError> {
        self.authorize(access_token).await?;
        let mut inbox = self.inbox.lock().await.clone();
        if inbox.len() == 1 && self.single_object.load(Ordering::SeqCst) {
            if let Some(only) = inbox.pop() {
                return Ok(OneOrMany::One(only));
            }
        }
        Ok(OneOrMany::Many(inbox))
    }

    async fn certificates(&self, access_token: &str) -> Result<CertificateSet, TransportError> {
        self.authorize(access_token).await?;
        self.certificate_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.certificates.lock().await.clone())
    }

    async fn acknowledge(&self, access_token: &str, msg_id: MsgId) -> Result<(), TransportError> {
        self.authorize(access_token).await?;
        self.inbox.lock().await.retain(|e| e.msg_id != msg_id);
        self.acknowledged.lock().await.push(msg_id);
        Ok(())
    }

    async fn broadcast(&self, access_token: &str, response: &ResponseEnvelope) -> Result<(), TransportError> {
        self.authorize(access_token).await?;
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(TransportError::BadResponse("status=502 body=\"bad gateway\"".into()));
        }
        self.broadcasts.lock().await.push(response.clone());
        Ok(())
    }
}

// ============================================================================
// Mock signing backend
// ============================================================================

/// In-memory signing backend. Submitted messages stay `PENDING_SIGN` until
/// a test resolves them.
#[derive(Default)]
pub struct MockSigningBackend {
    statuses: DashMap<MsgId, MessageStatus>,
    submitted: Mutex<Vec<VerifiedMessage>>,
    offline: AtomicBool,
}

impl MockSigningBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn submitted(&self) -> Vec<VerifiedMessage> {
        self.submitted.lock().await.clone()
    }

    /// Put `status` in the backend's books, tracked or not.
    pub fn set_status(&self, status: MessageStatus) {
        self.statuses.insert(status.msg_id, status);
    }

    /// Resolve a submitted message as signed. Unknown ids and empty
    /// payloads are ignored.
    pub async fn resolve_signed(&self, msg_id: MsgId, signed_payload: &str) {
        self.resolve(
            msg_id,
            SigningState::Signed {
                signed_payload: signed_payload.to_string(),
            },
        );
    }

    /// Resolve a submitted message as failed. Unknown ids and empty
    /// messages are ignored.
    pub async fn resolve_failed(&self, msg_id: MsgId, error_message: &str) {
        self.resolve(
            msg_id,
            SigningState::Failed {
                error_message: error_message.to_string(),
            },
        );
    }

    fn resolve(&self, msg_id: MsgId, state: SigningState) {
        if let Some(mut entry) = self.statuses.get_mut(&msg_id) {
            let current = entry.value();
            if let Ok(resolved) = MessageStatus::new(
                msg_id,
                current.request_id.clone(),
                current.message_type.clone(),
                current.payload.clone(),
                state,
            ) {
                *entry = resolved;
            }
        }
    }
}

#[async_trait]
impl SigningBackend for MockSigningBackend {
    async fn submit(&self, messages: &[VerifiedMessage]) -> Result<Vec<MessageStatus>, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("signing backend offline".into()));
        }
        self.submitted.lock().await.extend_from_slice(messages);

        let mut statuses = Vec::with_capacity(messages.len());
        for message in messages {
            let field = policy::request_id_field(message.message_type());
            let request_id = message.message[field].as_str().unwrap_or_default();
            let status = self
                .statuses
                .entry(message.msg_id())
                .or_insert_with(|| {
                    MessageStatus::pending(
                        message.msg_id(),
                        request_id,
                        message.message_type(),
                        message.message.clone(),
                    )
                })
                .clone();
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn query_status(&self, msg_ids: &[MsgId]) -> Result<Vec<MessageStatus>, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("signing backend offline".into()));
        }
        Ok(msg_ids
            .iter()
            .filter_map(|id| self.statuses.get(id).map(|s| s.value().clone()))
            .collect())
    }
}

// ============================================================================
// Pairing prompt
// ============================================================================

/// Hands out a fixed list of tokens, then gives up.
pub struct ScriptedPrompt {
    tokens: Mutex<VecDeque<String>>,
    asked: AtomicU32,
}

impl ScriptedPrompt {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().collect()),
            asked: AtomicU32::new(0),
        }
    }

    /// Number of tokens handed out.
    pub fn asked(&self) -> u32 {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PairingPrompt for ScriptedPrompt {
    async fn next_token(&self, _attempt: u32, _last_error: Option<&PairingError>) -> Option<String> {
        let token = self.tokens.lock().await.pop_front()?;
        self.asked.fetch_add(1, Ordering::SeqCst);
        Some(token)
    }
}
