//! Message verification.
//!
//! [`verify_envelope`] turns an [`InboundEnvelope`] into a
//! [`VerifiedMessage`] by interpreting the [`policy`](crate::policy) row for
//! the message's type. It only reads the certificate set it is given.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use hsr_crypto::{token, verify_signature, PublicKey};

use crate::errors::VerifyError;
use crate::message::{
    Envelope, InboundEnvelope, SignatureInfo, SignedMessage, TransportMetadata, VerifiedMessage,
};
use crate::policy::{self, MessagePolicy, PayloadSource, SignatureCheck, SignatureSource, VersionRule};
use crate::trust::TrustStore;
use crate::types::{certificate_key, CertificateSet, GATEWAY_BROKER};

pub struct MessageVerifier {
    trust: Arc<TrustStore>,
}

impl MessageVerifier {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub async fn verify(&self, envelope: &InboundEnvelope) -> Result<VerifiedMessage, VerifyError> {
        let certificates = self.trust.certificates().await?;
        verify_envelope(&certificates, envelope)
    }
}

pub fn verify_envelope(
    certificates: &CertificateSet,
    envelope: &InboundEnvelope,
) -> Result<VerifiedMessage, VerifyError> {
    let signed = open_envelope(certificates, &envelope.envelope)?;

    let policy = policy::policy_for(&signed.message_type)
        .ok_or_else(|| VerifyError::UnknownMessageType(signed.message_type.clone()))?;

    let message: Value = serde_json::from_str(&signed.payload)
        .map_err(|e| VerifyError::MalformedMessage(format!("payload is not JSON: {e}")))?;
    if !message.is_object() {
        return Err(VerifyError::MalformedMessage("payload is not a JSON object".into()));
    }

    let mut verified_by = Vec::with_capacity(policy.checks.len());
    for check in policy.checks {
        verified_by.push(run_check(certificates, &signed, check)?);
    }
    check_version(policy, &message)?;

    if policy.deprecated {
        debug!(msg_id = %envelope.msg_id, message_type = policy.message_type, "accepted deprecated message type");
    }
    debug!(msg_id = %envelope.msg_id, message_type = policy.message_type, ?verified_by, "message verified");

    Ok(VerifiedMessage {
        transport_metadata: TransportMetadata {
            msg_id: envelope.msg_id,
            device_id: envelope.device_id.clone(),
            internal_message_id: envelope.internal_message_id.clone(),
            message_type: signed.message_type,
        },
        message,
        verified_by,
    })
}

fn open_envelope(certificates: &CertificateSet, envelope: &Envelope) -> Result<SignedMessage, VerifyError> {
    let value = match envelope {
        Envelope::Structured(map) => Value::Object(map.clone()),
        Envelope::Encoded(jws) => {
            let broker = load_key(certificates, GATEWAY_BROKER)?;
            token::decode_verified::<Value>(jws, &broker).map_err(|e| VerifyError::SignatureInvalid {
                signer: GATEWAY_BROKER.to_string(),
                reason: e.to_string(),
            })?
        }
    };
    serde_json::from_value(value).map_err(|e| VerifyError::MalformedMessage(e.to_string()))
}

/// Run one signature check and return the certificate key it used.
fn run_check(
    certificates: &CertificateSet,
    signed: &SignedMessage,
    check: &SignatureCheck,
) -> Result<String, VerifyError> {
    let info = locate_signature(signed, check.signature)?;
    let payload = match check.payload {
        PayloadSource::Message => signed.payload.as_str(),
        PayloadSource::Metadata => match &signed.metadata {
            Some(metadata) => metadata.payload.as_str(),
            None => return Err(VerifyError::PolicySignatureMissing),
        },
    };

    let key_name = certificate_key(&info.signing_service_id);
    let key = load_key(certificates, key_name)?;
    verify_signature(&key, payload.as_bytes(), &info.signature, check.encoding).map_err(|e| {
        VerifyError::SignatureInvalid {
            signer: key_name.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(key_name.to_string())
}

fn locate_signature(signed: &SignedMessage, source: SignatureSource) -> Result<&SignatureInfo, VerifyError> {
    match source {
        SignatureSource::Primary => Ok(&signed.signature_info),
        SignatureSource::Metadata { signer } => {
            let wanted = certificate_key(signer);
            signed
                .metadata
                .as_ref()
                .and_then(|m| {
                    m.signature_info
                        .iter()
                        .find(|info| certificate_key(&info.signing_service_id) == wanted)
                })
                .ok_or(VerifyError::PolicySignatureMissing)
        }
    }
}

fn load_key(certificates: &CertificateSet, key: &str) -> Result<PublicKey, VerifyError> {
    let pem = certificates
        .get(key)
        .ok_or_else(|| VerifyError::CertificateMissing { key: key.to_string() })?;
    PublicKey::from_pem(pem).map_err(|e| VerifyError::InvalidCertificate {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn check_version(policy: &MessagePolicy, message: &Value) -> Result<(), VerifyError> {
    let VersionRule::Required { supported_majors } = policy.version else {
        return Ok(());
    };
    let declared = match message.get("version") {
        None | Some(Value::Null) => return Err(VerifyError::VersionMissing),
        Some(Value::String(s)) if s.trim().is_empty() => return Err(VerifyError::VersionMissing),
        Some(v) => v,
    };
    match policy::major_version(declared) {
        Some(major) if supported_majors.contains(&major) => Ok(()),
        _ => Err(VerifyError::UnsupportedVersion(match declared {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    }
}
