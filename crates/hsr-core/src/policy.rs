//! Verification policy per message type.
//!
//! Each supported message type lists the signatures that must check out
//! before the relay will forward it, plus any version rule. The verifier
//! interprets this table; adding a message type means adding a row.

use hsr_crypto::SignatureEncoding;

pub const EXTERNAL_KEY_PROOF_OF_OWNERSHIP: &str = "EXTERNAL_KEY_PROOF_OF_OWNERSHIP_REQUEST";
pub const KEY_LINK_PROOF_OF_OWNERSHIP: &str = "KEY_LINK_PROOF_OF_OWNERSHIP_REQUEST";
pub const KEY_LINK_TX_SIGN: &str = "KEY_LINK_TX_SIGN_REQUEST";

/// Major versions of proof-of-ownership payloads this relay understands.
pub const SUPPORTED_MAJOR_VERSIONS: &[u64] = &[1, 2];

/// Response field carrying the request id when the table has no entry.
pub const DEFAULT_REQUEST_ID_FIELD: &str = "requestId";

/// Where a check finds its signature and, through it, the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSource {
    /// The message's own `signatureInfo`; the signer is whoever it declares.
    Primary,
    /// The `metadata.signatureInfo` entry declared by `signer`.
    Metadata { signer: &'static str },
}

/// Which bytes the signature covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Message,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureCheck {
    pub signature: SignatureSource,
    pub payload: PayloadSource,
    pub encoding: SignatureEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRule {
    Exempt,
    /// The payload must carry a `version` whose major is listed.
    Required { supported_majors: &'static [u64] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePolicy {
    pub message_type: &'static str,
    /// Checked in order; the first entry is the primary signature.
    pub checks: &'static [SignatureCheck],
    pub version: VersionRule,
    /// Name of the request id in the payload and in the response.
    pub request_id_field: &'static str,
    pub deprecated: bool,
}

const PRIMARY_HEX: SignatureCheck = SignatureCheck {
    signature: SignatureSource::Primary,
    payload: PayloadSource::Message,
    encoding: SignatureEncoding::Hex,
};

const PRIMARY_BASE64: SignatureCheck = SignatureCheck {
    signature: SignatureSource::Primary,
    payload: PayloadSource::Message,
    encoding: SignatureEncoding::Base64,
};

const POLICY_SERVICE_BASE64: SignatureCheck = SignatureCheck {
    signature: SignatureSource::Metadata {
        signer: "POLICY_SERVICE",
    },
    payload: PayloadSource::Metadata,
    encoding: SignatureEncoding::Base64,
};

pub static POLICIES: &[MessagePolicy] = &[
    MessagePolicy {
        message_type: EXTERNAL_KEY_PROOF_OF_OWNERSHIP,
        checks: &[PRIMARY_HEX],
        version: VersionRule::Exempt,
        request_id_field: "requestId",
        deprecated: true,
    },
    MessagePolicy {
        message_type: KEY_LINK_PROOF_OF_OWNERSHIP,
        checks: &[PRIMARY_BASE64],
        version: VersionRule::Required {
            supported_majors: SUPPORTED_MAJOR_VERSIONS,
        },
        request_id_field: "requestId",
        deprecated: false,
    },
    MessagePolicy {
        message_type: KEY_LINK_TX_SIGN,
        checks: &[PRIMARY_BASE64, POLICY_SERVICE_BASE64],
        version: VersionRule::Exempt,
        request_id_field: "txId",
        deprecated: false,
    },
];

pub fn policy_for(message_type: &str) -> Option<&'static MessagePolicy> {
    POLICIES.iter().find(|p| p.message_type == message_type)
}

pub fn request_id_field(message_type: &str) -> &'static str {
    policy_for(message_type)
        .map(|p| p.request_id_field)
        .unwrap_or(DEFAULT_REQUEST_ID_FIELD)
}

/// Major component of a declared version: `2`, `2.1`, `"2.0.3"`, `"v1"`.
///
/// `None` if the text has no numeric major.
pub fn major_version(version: &serde_json::Value) -> Option<u64> {
    match version {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            let s = s.strip_prefix(&['v', 'V'][..]).unwrap_or(s);
            s.split('.').next()?.parse().ok()
        }
        _ => None,
    }
}
