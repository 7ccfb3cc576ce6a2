//! HSR Core - verification and signing orchestration for the HSM signing relay.
//!
//! This crate implements:
//! - The trust store of per-service certificates
//! - The type-indexed verification policy and message verifier
//! - Device identity persistence and pairing
//! - The message status cache and signing relay
//! - The agent loop and its scheduler

#![forbid(unsafe_code)]

// Verification
pub mod policy;
pub mod trust;
pub mod verify;

// Identity
pub mod pairing;
pub mod session;
pub mod store;

// Signing orchestration
pub mod agent;
pub mod relay;
pub mod status_cache;

// Supporting modules
pub mod errors;
#[cfg(any(test, feature = "test-util"))]
pub mod harness;
pub mod message;
pub mod transport;
pub mod types;

// Optional collaborator implementations
#[cfg(feature = "http")]
pub mod http;

#[cfg(test)]
mod proptests;

pub use errors::CoreError;
pub use message::{InboundEnvelope, MessageStatus, SigningState, StatusKind, VerifiedMessage};
pub use types::{CertificateSet, DeviceIdentity, MsgId};
