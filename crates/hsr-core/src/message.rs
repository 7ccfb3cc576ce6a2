//! Messages exchanged with the gateway and the signing backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::MsgId;

/// One delivery from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub msg_id: MsgId,
    pub device_id: String,
    pub internal_message_id: String,
    #[serde(rename = "msg")]
    pub envelope: Envelope,
}

/// The message inside an [`InboundEnvelope`].
///
/// The gateway either forwards a signed token or an object it has already
/// decoded. Which one is settled here, when the envelope is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Compact JWS signed by the gateway broker.
    Encoded(String),
    /// Decoded message object.
    Structured(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signing_service_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Exact bytes signed by the metadata signers.
    pub payload: String,
    #[serde(default)]
    pub signature_info: Vec<SignatureInfo>,
}

/// A signing request as produced by the originating service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    /// Exact bytes signed by the primary signer; a JSON object.
    pub payload: String,
    pub signature_info: SignatureInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetadata {
    pub msg_id: MsgId,
    pub device_id: String,
    pub internal_message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
}

/// A message whose signatures all checked out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedMessage {
    pub transport_metadata: TransportMetadata,
    pub message: Value,
    /// Certificate keys whose signatures were checked, primary first.
    #[serde(skip)]
    pub verified_by: Vec<String>,
}

impl VerifiedMessage {
    pub fn msg_id(&self) -> MsgId {
        self.transport_metadata.msg_id
    }

    pub fn message_type(&self) -> &str {
        &self.transport_metadata.message_type
    }
}

// ============================================================================
// Signing status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    PendingSign,
    Signed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningState {
    PendingSign,
    Signed { signed_payload: String },
    Failed { error_message: String },
}

impl SigningState {
    pub fn kind(&self) -> StatusKind {
        match self {
            SigningState::PendingSign => StatusKind::PendingSign,
            SigningState::Signed { .. } => StatusKind::Signed,
            SigningState::Failed { .. } => StatusKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SigningState::PendingSign)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message status: {0}")]
pub struct InvalidStatus(&'static str);

/// Signing progress of one message.
///
/// A `SIGNED` status always carries a non-empty signed payload and a
/// `FAILED` status a non-empty error message; the constructor and the
/// deserializer both refuse anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MessageStatusRecord", into = "MessageStatusRecord")]
pub struct MessageStatus {
    pub msg_id: MsgId,
    pub request_id: String,
    pub message_type: String,
    pub payload: Value,
    state: SigningState,
}

impl MessageStatus {
    pub fn new(
        msg_id: MsgId,
        request_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
        state: SigningState,
    ) -> Result<Self, InvalidStatus> {
        match &state {
            SigningState::Signed { signed_payload } if signed_payload.is_empty() => {
                return Err(InvalidStatus("SIGNED without signedPayload"))
            }
            SigningState::Failed { error_message } if error_message.is_empty() => {
                return Err(InvalidStatus("FAILED without errorMessage"))
            }
            _ => {}
        }
        Ok(Self {
            msg_id,
            request_id: request_id.into(),
            message_type: message_type.into(),
            payload,
            state,
        })
    }

    pub fn pending(
        msg_id: MsgId,
        request_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            msg_id,
            request_id: request_id.into(),
            message_type: message_type.into(),
            payload,
            state: SigningState::PendingSign,
        }
    }

    pub fn state(&self) -> &SigningState {
        &self.state
    }

    pub fn kind(&self) -> StatusKind {
        self.state.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStatusRecord {
    msg_id: MsgId,
    #[serde(default)]
    request_id: String,
    #[serde(rename = "type", default)]
    message_type: String,
    status: StatusKind,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signed_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl TryFrom<MessageStatusRecord> for MessageStatus {
    type Error = InvalidStatus;

    fn try_from(r: MessageStatusRecord) -> Result<Self, Self::Error> {
        let state = match (r.status, r.signed_payload, r.error_message) {
            (StatusKind::PendingSign, None, None) => SigningState::PendingSign,
            (StatusKind::PendingSign, _, _) => {
                return Err(InvalidStatus("PENDING_SIGN with a result attached"))
            }
            (StatusKind::Signed, Some(signed_payload), None) => SigningState::Signed { signed_payload },
            (StatusKind::Signed, _, _) => return Err(InvalidStatus("SIGNED needs exactly a signedPayload")),
            (StatusKind::Failed, None, Some(error_message)) => SigningState::Failed { error_message },
            (StatusKind::Failed, _, _) => return Err(InvalidStatus("FAILED needs exactly an errorMessage")),
        };
        MessageStatus::new(r.msg_id, r.request_id, r.message_type, r.payload, state)
    }
}

impl From<MessageStatus> for MessageStatusRecord {
    fn from(s: MessageStatus) -> Self {
        let status = s.state.kind();
        let (signed_payload, error_message) = match s.state {
            SigningState::PendingSign => (None, None),
            SigningState::Signed { signed_payload } => (Some(signed_payload), None),
            SigningState::Failed { error_message } => (None, Some(error_message)),
        };
        Self {
            msg_id: s.msg_id,
            request_id: s.request_id,
            message_type: s.message_type,
            status,
            payload: s.payload,
            signed_payload,
            error_message,
        }
    }
}

// ============================================================================
// Gateway-bound payloads
// ============================================================================

const RESPONSE_SUFFIX: &str = "_RESPONSE";

/// Terminal result reported back to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub msg_id: MsgId,
    #[serde(rename = "type")]
    pub message_type: String,
    pub status: StatusKind,
    pub payload: Value,
}

impl ResponseEnvelope {
    /// Build the response for a terminal status. `None` while still pending.
    pub fn from_status(status: &MessageStatus, request_id_field: &str) -> Option<Self> {
        let mut payload = Map::new();
        payload.insert(request_id_field.to_string(), Value::String(status.request_id.clone()));
        match status.state() {
            SigningState::PendingSign => return None,
            SigningState::Signed { signed_payload } => {
                payload.insert("signedPayload".into(), Value::String(signed_payload.clone()));
            }
            SigningState::Failed { error_message } => {
                payload.insert("errorMessage".into(), Value::String(error_message.clone()));
            }
        }
        Some(Self {
            msg_id: status.msg_id,
            message_type: format!("{}{RESPONSE_SUFFIX}", status.message_type),
            status: status.kind(),
            payload: Value::Object(payload),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairDeviceRequest {
    pub user_id: String,
    pub pairing_token: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairDeviceResponse {
    pub refresh_token: String,
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_variant_follows_json_shape() {
        let encoded: InboundEnvelope = serde_json::from_value(json!({
            "msgId": 7, "deviceId": "d", "internalMessageId": "i", "msg": "a.b.c"
        }))
        .unwrap();
        assert_eq!(encoded.envelope, Envelope::Encoded("a.b.c".into()));

        let structured: InboundEnvelope = serde_json::from_value(json!({
            "msgId": 8, "deviceId": "d", "internalMessageId": "i", "msg": {"type": "X"}
        }))
        .unwrap();
        assert!(matches!(structured.envelope, Envelope::Structured(ref m) if m["type"] == "X"));
    }

    #[test]
    fn test_status_invariant_is_enforced_on_deserialize() {
        let ok: MessageStatus = serde_json::from_value(json!({
            "msgId": 1, "requestId": "r", "type": "T", "status": "SIGNED",
            "payload": {}, "signedPayload": "sig"
        }))
        .unwrap();
        assert!(ok.is_terminal());

        for bad in [
            json!({"msgId": 1, "status": "SIGNED"}),
            json!({"msgId": 1, "status": "SIGNED", "signedPayload": ""}),
            json!({"msgId": 1, "status": "FAILED"}),
            json!({"msgId": 1, "status": "PENDING_SIGN", "errorMessage": "x"}),
        ] {
            assert!(serde_json::from_value::<MessageStatus>(bad).is_err());
        }
    }

    #[test]
    fn test_status_serializes_flat() {
        let status = MessageStatus::new(
            MsgId(3),
            "tx-9",
            "KEY_LINK_TX_SIGN_REQUEST",
            json!({"txId": "tx-9"}),
            SigningState::Failed { error_message: "policy denied".into() },
        )
        .unwrap();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["errorMessage"], "policy denied");
        assert!(value.get("signedPayload").is_none());
    }

    #[test]
    fn test_response_envelope_for_signed_status() {
        let status = MessageStatus::new(
            MsgId(5),
            "tx-1",
            "KEY_LINK_TX_SIGN_REQUEST",
            json!({}),
            SigningState::Signed { signed_payload: "3045".into() },
        )
        .unwrap();
        let response = ResponseEnvelope::from_status(&status, "txId").unwrap();
        assert_eq!(response.message_type, "KEY_LINK_TX_SIGN_REQUEST_RESPONSE");
        assert_eq!(response.status, StatusKind::Signed);
        assert_eq!(response.payload, json!({"txId": "tx-1", "signedPayload": "3045"}));
    }

    #[test]
    fn test_no_response_for_pending_status() {
        let status = MessageStatus::pending(MsgId(5), "r", "T", json!({}));
        assert!(ResponseEnvelope::from_status(&status, "requestId").is_none());
    }
}
