//! Hand-off between the signing backend and the gateway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::RelayError;
use crate::message::{MessageStatus, ResponseEnvelope, VerifiedMessage};
use crate::policy;
use crate::session::GatewaySession;
use crate::transport::{with_timeout, SigningBackend};
use crate::types::MsgId;

pub struct SigningRelay {
    backend: Arc<dyn SigningBackend>,
    gateway: Arc<GatewaySession>,
    timeout: Duration,
}

impl SigningRelay {
    pub fn new(backend: Arc<dyn SigningBackend>, gateway: Arc<GatewaySession>, timeout: Duration) -> Self {
        Self {
            backend,
            gateway,
            timeout,
        }
    }

    /// Send a batch to the backend. The result holds one status per
    /// submitted message the backend accepted, matched by msgId; a
    /// transport failure fails the whole batch.
    pub async fn dispatch(&self, messages: &[VerifiedMessage]) -> Result<Vec<MessageStatus>, RelayError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let returned = with_timeout(self.timeout, self.backend.submit(messages)).await?;

        let submitted: HashSet<MsgId> = messages.iter().map(VerifiedMessage::msg_id).collect();
        let mut statuses = Vec::with_capacity(messages.len());
        let mut seen = HashSet::new();
        for status in returned {
            if !submitted.contains(&status.msg_id) {
                warn!(msg_id = %status.msg_id, "backend returned status for a message not in the batch");
                continue;
            }
            if seen.insert(status.msg_id) {
                statuses.push(status);
            }
        }
        for message in messages.iter().filter(|m| !seen.contains(&m.msg_id())) {
            warn!(msg_id = %message.msg_id(), "backend returned no status for submitted message");
        }

        debug!(submitted = messages.len(), accepted = statuses.len(), "batch dispatched");
        Ok(statuses)
    }

    /// Current status for each id the backend recognizes.
    pub async fn fetch_status(&self, msg_ids: &[MsgId]) -> Result<Vec<MessageStatus>, RelayError> {
        if msg_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(with_timeout(self.timeout, self.backend.query_status(msg_ids)).await?)
    }

    /// Report a terminal status to the gateway.
    pub async fn broadcast_result(&self, status: &MessageStatus) -> Result<(), RelayError> {
        let field = policy::request_id_field(&status.message_type);
        let response = ResponseEnvelope::from_status(status, field).ok_or(RelayError::NotTerminal(status.msg_id))?;
        self.gateway.broadcast(&response).await?;
        debug!(msg_id = %status.msg_id, status = ?response.status, "result broadcast");
        Ok(())
    }

    /// Mark the source message consumed so the gateway stops redelivering it.
    pub async fn acknowledge(&self, msg_id: MsgId) -> Result<(), RelayError> {
        self.gateway.acknowledge(msg_id).await?;
        debug!(msg_id = %msg_id, "message acknowledged");
        Ok(())
    }
}
