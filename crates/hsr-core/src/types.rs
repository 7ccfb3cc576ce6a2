use std::collections::BTreeMap;
use std::fmt;

use hsr_crypto::hash::pem_fingerprint;
use serde::{Deserialize, Serialize};

/// Gateway-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub u64);

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MsgId {
    fn from(v: u64) -> Self {
        MsgId(v)
    }
}

/// The durable identity obtained by pairing this device with a user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
    pub refresh_token: String,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

// Short certificate keys of the services that sign relay traffic.
pub const GATEWAY_BROKER: &str = "zs";
pub const VAULT_SERVICE: &str = "vs";
pub const POLICY_SERVICE: &str = "ps";
pub const CONFIGURATION_MANAGER: &str = "cm";

const SIGNER_IDS: &[(&str, &str)] = &[
    ("ZSERVICE", GATEWAY_BROKER),
    ("VAULT_SERVICE", VAULT_SERVICE),
    ("POLICY_SERVICE", POLICY_SERVICE),
    ("CONFIGURATION_MANAGER", CONFIGURATION_MANAGER),
];

/// Map a `signingServiceId` to the certificate key it is looked up under.
///
/// Long service ids map to their short key. Anything else, including the
/// short keys themselves, is looked up verbatim.
pub fn certificate_key(signing_service_id: &str) -> &str {
    SIGNER_IDS
        .iter()
        .find(|(id, _)| *id == signing_service_id)
        .map(|(_, key)| *key)
        .unwrap_or(signing_service_id)
}

/// Service key to PEM certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateSet(BTreeMap<String, String>);

impl CertificateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, pem: impl Into<String>) {
        self.0.insert(key.into(), pem.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Service key with a short fingerprint of its certificate, for logs.
    pub fn fingerprints(&self) -> Vec<(&str, String)> {
        self.0
            .iter()
            .map(|(key, pem)| (key.as_str(), pem_fingerprint(pem)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CertificateSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
