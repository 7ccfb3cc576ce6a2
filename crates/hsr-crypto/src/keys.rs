//! Verification and signing keys loaded from PEM.
//!
//! Service certificates arrive as PEM text, either X.509 `CERTIFICATE`
//! blocks or bare SPKI `PUBLIC KEY` blocks. The key type inside decides the
//! signature scheme: RSA keys verify RSASSA-PKCS1-v1_5/SHA-256, P-256 keys
//! verify ECDSA/SHA-256.

use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

use crate::error::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    pub(crate) fn jwt_algorithm(self) -> Algorithm {
        match self {
            KeyAlgorithm::Rsa => Algorithm::RS256,
            KeyAlgorithm::Ecdsa => Algorithm::ES256,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => write!(f, "RSA/SHA-256"),
            KeyAlgorithm::Ecdsa => write!(f, "ECDSA-P256/SHA-256"),
        }
    }
}

/// A public verification key parsed from a service certificate.
#[derive(Clone)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    key: DecodingKey,
}

impl PublicKey {
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let bytes = pem.trim().as_bytes();
        let (algorithm, key) = match DecodingKey::from_rsa_pem(bytes) {
            Ok(key) => (KeyAlgorithm::Rsa, key),
            Err(_) => {
                let key = DecodingKey::from_ec_pem(bytes).map_err(|e| {
                    CryptoError::InvalidKey(format!("neither RSA nor P-256: {e}"))
                })?;
                (KeyAlgorithm::Ecdsa, key)
            }
        };

        Ok(Self { algorithm, key })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A private signing key.
///
/// The relay itself never signs anything; this exists so test fixtures and
/// simulators can produce messages the verifier accepts.
#[derive(Clone)]
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    key: EncodingKey,
}

impl PrivateKey {
    /// Load a PKCS#1 RSA key (`RSA PRIVATE KEY`) or a PKCS#8 P-256 key
    /// (`PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let bytes = pem.trim().as_bytes();
        if pem.contains("RSA PRIVATE KEY") {
            let key = EncodingKey::from_rsa_pem(bytes)?;
            return Ok(Self {
                algorithm: KeyAlgorithm::Rsa,
                key,
            });
        }
        let key = EncodingKey::from_ec_pem(bytes)?;
        Ok(Self {
            algorithm: KeyAlgorithm::Ecdsa,
            key,
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const RSA_CERT: &str = include_str!("../../hsr-core/testdata/zs_cert.pem");
    pub const RSA_KEY: &str = include_str!("../../hsr-core/testdata/zs_key.pem");
    pub const RSA_SPKI: &str = include_str!("../../hsr-core/testdata/cm_pub.pem");
    pub const RSA_SPKI_KEY: &str = include_str!("../../hsr-core/testdata/cm_key.pem");
    pub const EC_CERT: &str = include_str!("../../hsr-core/testdata/ps_cert.pem");
    pub const EC_KEY: &str = include_str!("../../hsr-core/testdata/ps_key.pem");
    pub const OTHER_RSA_CERT: &str = include_str!("../../hsr-core/testdata/rogue_cert.pem");
}
