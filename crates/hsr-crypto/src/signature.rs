//! Detached signature checks over raw payload bytes.
//!
//! Signing services publish signatures either hex or base64 encoded; the
//! caller says which. The digest is always SHA-256. ECDSA signatures are
//! accepted in fixed-width `r||s` form or strict ASN.1 DER; a 64-byte
//! signature is always read as `r||s`.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::Signature as EcdsaSignature;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keys::{KeyAlgorithm, PrivateKey, PublicKey};

/// Width of one P-256 scalar in bytes.
const P256_SCALAR_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

impl SignatureEncoding {
    pub fn name(self) -> &'static str {
        match self {
            SignatureEncoding::Hex => "hex",
            SignatureEncoding::Base64 => "base64",
        }
    }

    pub fn decode(self, text: &str) -> Result<Vec<u8>, CryptoError> {
        let text = text.trim();
        let decoded = match self {
            SignatureEncoding::Hex => hex::decode(text).map_err(|e| e.to_string()),
            SignatureEncoding::Base64 => STANDARD.decode(text).map_err(|e| e.to_string()),
        };
        decoded.map_err(|reason| CryptoError::InvalidEncoding {
            encoding: self.name(),
            reason,
        })
    }

    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            SignatureEncoding::Hex => hex::encode(bytes),
            SignatureEncoding::Base64 => STANDARD.encode(bytes),
        }
    }
}

/// Verify `signature` over `payload` with `key`.
pub fn verify_signature(
    key: &PublicKey,
    payload: &[u8],
    signature: &str,
    encoding: SignatureEncoding,
) -> Result<(), CryptoError> {
    let mut raw = encoding.decode(signature)?;
    if raw.is_empty() {
        return Err(CryptoError::SignatureMismatch);
    }
    if key.algorithm() == KeyAlgorithm::Ecdsa {
        raw = if raw.len() == 2 * P256_SCALAR_LEN {
            EcdsaSignature::from_slice(&raw)
                .map_err(|_| CryptoError::MalformedSignature)?
                .to_bytes()
                .to_vec()
        } else {
            ecdsa_der_to_fixed(&raw)?
        };
    }

    let verified = jsonwebtoken::crypto::verify(
        &URL_SAFE_NO_PAD.encode(&raw),
        payload,
        key.decoding_key(),
        key.algorithm().jwt_algorithm(),
    )?;

    if verified {
        Ok(())
    } else {
        Err(CryptoError::SignatureMismatch)
    }
}

/// Sign `payload` and encode the signature. ECDSA output is fixed-width.
pub fn sign_payload(
    key: &PrivateKey,
    payload: &[u8],
    encoding: SignatureEncoding,
) -> Result<String, CryptoError> {
    let jws = jsonwebtoken::crypto::sign(
        payload,
        key.encoding_key(),
        key.algorithm().jwt_algorithm(),
    )?;
    let raw = URL_SAFE_NO_PAD
        .decode(jws)
        .map_err(|e| CryptoError::Token(e.to_string()))?;
    Ok(encoding.encode(&raw))
}

/// Convert a strict ASN.1 DER `ECDSA-Sig-Value` into fixed-width `r||s`.
///
/// Non-minimal integers, long-form lengths and trailing bytes are rejected.
pub fn ecdsa_der_to_fixed(der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signature = EcdsaSignature::from_der(der).map_err(|_| CryptoError::MalformedSignature)?;
    Ok(signature.to_bytes().to_vec())
}

/// Convert fixed-width `r||s` into ASN.1 DER.
pub fn ecdsa_fixed_to_der(fixed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signature = EcdsaSignature::from_slice(fixed).map_err(|_| CryptoError::MalformedSignature)?;
    Ok(signature.to_der().as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::fixtures::*;

    const PAYLOAD: &[u8] = br#"{"txId":"tx-1","amount":"10"}"#;

    #[test]
    fn test_rsa_hex_signature_verifies() {
        let sk = PrivateKey::from_pem(RSA_KEY).unwrap();
        let pk = PublicKey::from_pem(RSA_CERT).unwrap();
        let sig = sign_payload(&sk, PAYLOAD, SignatureEncoding::Hex).unwrap();
        assert!(verify_signature(&pk, PAYLOAD, &sig, SignatureEncoding::Hex).is_ok());
    }

    #[test]
    fn test_rsa_base64_signature_verifies_against_spki() {
        let sk = PrivateKey::from_pem(RSA_SPKI_KEY).unwrap();
        let pk = PublicKey::from_pem(RSA_SPKI).unwrap();
        let sig = sign_payload(&sk, PAYLOAD, SignatureEncoding::Base64).unwrap();
        assert!(verify_signature(&pk, PAYLOAD, &sig, SignatureEncoding::Base64).is_ok());
    }

    #[test]
    fn test_wrong_encoding_is_rejected() {
        let sk = PrivateKey::from_pem(RSA_KEY).unwrap();
        let pk = PublicKey::from_pem(RSA_CERT).unwrap();
        let sig = sign_payload(&sk, PAYLOAD, SignatureEncoding::Base64).unwrap();
        assert!(verify_signature(&pk, PAYLOAD, &sig, SignatureEncoding::Hex).is_err());
    }

    #[test]
    fn test_signature_from_other_key_fails() {
        let sk = PrivateKey::from_pem(RSA_KEY).unwrap();
        let other = PublicKey::from_pem(OTHER_RSA_CERT).unwrap();
        let sig = sign_payload(&sk, PAYLOAD, SignatureEncoding::Hex).unwrap();
        assert_eq!(
            verify_signature(&other, PAYLOAD, &sig, SignatureEncoding::Hex),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn test_tampered_payload_fails() {
        let sk = PrivateKey::from_pem(RSA_KEY).unwrap();
        let pk = PublicKey::from_pem(RSA_CERT).unwrap();
        let sig = sign_payload(&sk, PAYLOAD, SignatureEncoding::Hex).unwrap();
        assert_eq!(
            verify_signature(&pk, br#"{"txId":"tx-2","amount":"10"}"#, &sig, SignatureEncoding::Hex),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn test_ecdsa_fixed_and_der_both_verify() {
        let sk = PrivateKey::from_pem(EC_KEY).unwrap();
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let fixed_b64 = sign_payload(&sk, PAYLOAD, SignatureEncoding::Base64).unwrap();
        assert!(verify_signature(&pk, PAYLOAD, &fixed_b64, SignatureEncoding::Base64).is_ok());

        let fixed = SignatureEncoding::Base64.decode(&fixed_b64).unwrap();
        let der = ecdsa_fixed_to_der(&fixed).unwrap();
        let der_hex = SignatureEncoding::Hex.encode(&der);
        assert!(verify_signature(&pk, PAYLOAD, &der_hex, SignatureEncoding::Hex).is_ok());
    }

    #[test]
    fn test_ecdsa_garbage_signature_is_malformed() {
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let err = verify_signature(&pk, PAYLOAD, "deadbeef", SignatureEncoding::Hex).unwrap_err();
        assert_eq!(err, CryptoError::MalformedSignature);
    }

    #[test]
    fn test_empty_and_undecodable_signatures() {
        let pk = PublicKey::from_pem(RSA_CERT).unwrap();
        assert_eq!(
            verify_signature(&pk, PAYLOAD, "", SignatureEncoding::Hex),
            Err(CryptoError::SignatureMismatch)
        );
        assert!(matches!(
            verify_signature(&pk, PAYLOAD, "zz-not-hex", SignatureEncoding::Hex),
            Err(CryptoError::InvalidEncoding { encoding: "hex", .. })
        ));
    }

    #[test]
    fn test_der_with_leading_zero_integers() {
        let mut fixed = [0u8; 64];
        fixed[0] = 0x80;
        fixed[31] = 1;
        fixed[63] = 2;
        let der = ecdsa_fixed_to_der(&fixed).unwrap();
        // r needs a sign byte, s collapses to a single byte
        assert_eq!(der[2..5], [0x02, 33, 0x00]);
        assert_eq!(ecdsa_der_to_fixed(&der).unwrap(), fixed.to_vec());
    }

    fn ec_fixed_signature() -> Vec<u8> {
        let sk = PrivateKey::from_pem(EC_KEY).unwrap();
        let b64 = sign_payload(&sk, PAYLOAD, SignatureEncoding::Base64).unwrap();
        SignatureEncoding::Base64.decode(&b64).unwrap()
    }

    #[test]
    fn test_ecdsa_der_with_padded_integers_is_rejected() {
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let fixed = ec_fixed_signature();

        // Two redundant zero bytes before each scalar: same values, non-minimal encoding.
        let mut der = vec![0x30, 0x48];
        for scalar in fixed.chunks(P256_SCALAR_LEN) {
            der.extend_from_slice(&[0x02, 0x22, 0x00, 0x00]);
            der.extend_from_slice(scalar);
        }
        assert_eq!(ecdsa_der_to_fixed(&der), Err(CryptoError::MalformedSignature));
        assert_eq!(
            verify_signature(&pk, PAYLOAD, &hex::encode(&der), SignatureEncoding::Hex),
            Err(CryptoError::MalformedSignature)
        );
    }

    #[test]
    fn test_ecdsa_der_with_trailing_bytes_is_rejected() {
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let mut der = ecdsa_fixed_to_der(&ec_fixed_signature()).unwrap();
        assert!(verify_signature(&pk, PAYLOAD, &hex::encode(&der), SignatureEncoding::Hex).is_ok());

        der.push(0x00);
        assert_eq!(
            verify_signature(&pk, PAYLOAD, &hex::encode(&der), SignatureEncoding::Hex),
            Err(CryptoError::MalformedSignature)
        );
    }

    #[test]
    fn test_ecdsa_fixed_signature_with_zero_scalar_is_malformed() {
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let mut fixed = ec_fixed_signature();
        fixed[P256_SCALAR_LEN..].fill(0);
        assert_eq!(
            verify_signature(&pk, PAYLOAD, &hex::encode(&fixed), SignatureEncoding::Hex),
            Err(CryptoError::MalformedSignature)
        );
    }
}
