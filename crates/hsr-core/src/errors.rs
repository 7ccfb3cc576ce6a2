//! Error types for HSR Core.
//!
//! Each concern gets its own enum; [`CoreError`] unifies them for callers
//! that drive a whole cycle.

use std::time::Duration;

use thiserror::Error;

use crate::message::InvalidStatus;
use crate::store::StoreError;
use crate::types::MsgId;
use hsr_crypto::CryptoError;

// ============================================================================
// Transport
// ============================================================================

/// Failures talking to the gateway or the signing backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The collaborator could not be reached.
    #[error("transport failed: unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request (authentication or authorization).
    #[error("transport failed: rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    /// The collaborator answered with something we cannot use.
    #[error("transport failed: bad response: {0}")]
    BadResponse(String),

    #[error("transport failed: timed out after {0:?}")]
    Timeout(Duration),

    /// No device identity is persisted, so there is nothing to authenticate with.
    #[error("transport failed: device is not paired")]
    NotPaired,
}

impl TransportError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::Rejected { .. })
    }
}

impl From<InvalidStatus> for TransportError {
    fn from(err: InvalidStatus) -> Self {
        TransportError::BadResponse(err.to_string())
    }
}

// ============================================================================
// Trust
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// Fetching the certificate set failed and nothing is cached.
    #[error("certificates unavailable: {0}")]
    CertificateUnavailable(TransportError),

    #[error("no certificate registered for service key {0:?}")]
    CertificateMissing(String),
}

// ============================================================================
// Verification
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no certificate registered for service key {key:?}")]
    CertificateMissing { key: String },

    #[error("certificate for {key:?} is unusable: {reason}")]
    InvalidCertificate { key: String, reason: String },

    #[error("signature by {signer:?} is invalid: {reason}")]
    SignatureInvalid { signer: String, reason: String },

    #[error("payload does not declare a version")]
    VersionMissing,

    #[error("unsupported version {0:?}")]
    UnsupportedVersion(String),

    #[error("no policy signature present in metadata")]
    PolicySignatureMissing,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    /// The trust store could not produce any certificates.
    #[error("certificates unavailable: {0}")]
    CertificateUnavailable(TransportError),
}

impl VerifyError {
    /// Whether the failure belongs to the message rather than the environment.
    ///
    /// Message-local failures drop that one message; anything else aborts
    /// the ingestion step so it can be retried on the next tick.
    pub fn is_message_local(&self) -> bool {
        !matches!(self, VerifyError::CertificateUnavailable(_))
    }
}

impl From<TrustError> for VerifyError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::CertificateUnavailable(e) => VerifyError::CertificateUnavailable(e),
            TrustError::CertificateMissing(key) => VerifyError::CertificateMissing { key },
        }
    }
}

// ============================================================================
// Pairing
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The token is not structurally usable (undecodable or no userId).
    #[error("pairing token is invalid: {0}")]
    InvalidToken(String),

    #[error("pairing rejected: {0}")]
    PairingRejected(String),

    #[error("pairing failed: {0}")]
    Transport(TransportError),

    #[error("pairing failed: {0}")]
    Store(#[from] StoreError),

    #[error("could not generate a device id: {0}")]
    DeviceId(String),
}

impl From<TransportError> for PairingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { reason, .. } => PairingError::PairingRejected(reason),
            other => PairingError::Transport(other),
        }
    }
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    RelayUnavailable(#[from] TransportError),

    #[error("message {0} has no terminal status to report")]
    NotTerminal(MsgId),
}

// ============================================================================
// Unified error
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("trust error: {0}")]
    Trust(#[from] TrustError),

    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),

    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
