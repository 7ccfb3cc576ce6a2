//! Signature primitives used by the relay's message verifier.
//!
//! Everything here is synchronous and side-effect free: parsing PEM
//! certificates into verification keys, checking SHA-256 RSA/ECDSA
//! signatures in hex or base64 form, and decoding signed tokens.

#![forbid(unsafe_code)]

pub mod error;
pub mod hash;
pub mod keys;
pub mod signature;
pub mod token;

#[cfg(test)]
mod proptests;

pub use error::CryptoError;
pub use keys::{KeyAlgorithm, PrivateKey, PublicKey};
pub use signature::{verify_signature, SignatureEncoding};
