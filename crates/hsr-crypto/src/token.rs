//! Compact signed tokens (JWS/JWT).
//!
//! Encoded gateway envelopes and gateway access tokens are both JWTs. The
//! former are verified against the issuing service's certificate; the
//! latter are only inspected for their expiry.

use jsonwebtoken::{decode, encode, DecodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keys::{PrivateKey, PublicKey};

/// Decode `token`, checking its signature against `key`.
///
/// The token's `alg` must match the key family (RS256 for RSA, ES256 for
/// P-256). An `exp` claim, if present, is enforced; no other claim is
/// required.
pub fn decode_verified<T: DeserializeOwned>(token: &str, key: &PublicKey) -> Result<T, CryptoError> {
    let mut validation = Validation::new(key.algorithm().jwt_algorithm());
    validation.required_spec_claims.clear();
    validation.validate_aud = false;

    let data = decode::<T>(token.trim(), key.decoding_key(), &validation)?;
    Ok(data.claims)
}

/// Decode `token` without checking its signature or any claim.
pub fn decode_unverified<T: DeserializeOwned>(token: &str) -> Result<T, CryptoError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let data = decode::<T>(token.trim(), &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

/// Sign `claims` into a compact token with `key`.
pub fn encode_signed<T: Serialize>(claims: &T, key: &PrivateKey) -> Result<String, CryptoError> {
    let header = Header::new(key.algorithm().jwt_algorithm());
    Ok(encode(&header, claims, key.encoding_key())?)
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<u64>,
}

/// The `exp` claim of `token` in unix seconds, if it has one and parses.
pub fn expires_at(token: &str) -> Option<u64> {
    decode_unverified::<ExpiryClaim>(token).ok().and_then(|c| c.exp)
}
