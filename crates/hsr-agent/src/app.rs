//! Wiring from configuration to a running agent.

use std::sync::Arc;

use hsr_core::agent::{AgentLoop, PairingPrompt};
use hsr_core::errors::PairingError;
use hsr_core::http::{HttpGateway, HttpSigningBackend};
use hsr_core::pairing;
use hsr_core::store::{IdentityStore, StoreError};
use hsr_core::transport::{Gateway, SigningBackend};
use hsr_core::DeviceIdentity;
use tracing::info;

use crate::config::AgentConfig;
use crate::identity::FileIdentityStore;
use crate::prompt::{StaticTokenPrompt, StdinPairingPrompt, DEFAULT_MAX_ATTEMPTS};

/// Build the agent with HTTP collaborators and the file-backed identity.
pub fn build_agent(config: &AgentConfig) -> anyhow::Result<AgentLoop> {
    let gateway = Arc::new(HttpGateway::new(&config.gateway_url)?);
    let backend = Arc::new(HttpSigningBackend::new(
        &config.backend_url,
        config.backend_token.clone(),
    )?);
    Ok(build_agent_with(config, gateway, backend))
}

pub fn build_agent_with(
    config: &AgentConfig,
    gateway: Arc<dyn Gateway>,
    backend: Arc<dyn SigningBackend>,
) -> AgentLoop {
    let store: Arc<dyn IdentityStore> = Arc::new(FileIdentityStore::new(&config.identity_path));
    info!(
        gateway = %config.gateway_url,
        backend = %config.backend_url,
        identity = %config.identity_path.display(),
        "agent configured"
    );
    AgentLoop::new(gateway, backend, store, config.to_settings())
}

/// Token source for pairing: an explicit token wins over the configured
/// one; with neither, the operator is asked on stdin.
pub fn pairing_prompt(cli_token: Option<String>, config: &AgentConfig) -> Box<dyn PairingPrompt> {
    match preset_token(cli_token, config) {
        Some(token) => Box::new(StaticTokenPrompt::new(token)),
        None => Box::new(StdinPairingPrompt::stdin(DEFAULT_MAX_ATTEMPTS)),
    }
}

fn preset_token(cli_token: Option<String>, config: &AgentConfig) -> Option<String> {
    cli_token
        .or_else(|| config.pairing_token.clone())
        .filter(|t| !t.trim().is_empty())
}

/// Pair with `token`, replacing any stored identity. The device id is kept
/// from the configuration or the previous identity when there is one.
pub async fn repair(agent: &AgentLoop, config: &AgentConfig, token: &str) -> Result<DeviceIdentity, PairingError> {
    let device_id = match &config.device_id {
        Some(id) => id.clone(),
        None => match agent.pairing().identity().await? {
            Some(existing) => existing.device_id,
            None => pairing::generate_device_id()?,
        },
    };
    agent.pairing().pair_device(token, &device_id).await
}

/// Human-readable pairing status. Never includes the refresh token.
pub async fn describe_identity(store: &dyn IdentityStore) -> Result<String, StoreError> {
    Ok(match store.load().await? {
        Some(identity) => format!(
            "paired\n  user:   {}\n  device: {}",
            identity.user_id, identity.device_id
        ),
        None => "not paired".to_string(),
    })
}
