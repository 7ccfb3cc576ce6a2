//! HSR Agent - the HSM signing relay daemon.
//!
//! Loads configuration, pairs the device with the gateway, and runs the
//! relay loop from `hsr-core` against HTTP collaborators until shut down.

#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod identity;
pub mod logging;
pub mod prompt;
pub mod service;
