//! The agent control loop.
//!
//! ```text
//! UNPAIRED ──▶ PAIRING ──▶ RUNNING
//!                 ▲  │
//!                 └──┘ rejected token, prompt again
//! ```
//!
//! While running, two timers share one task. The ingestion timer fetches
//! envelopes, verifies them, and dispatches the verified ones; the status
//! timer polls the backend and reports terminal results to the gateway.
//! Failures are logged and retried on the next tick; only shutdown stops
//! the loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::errors::{CoreError, PairingError};
use crate::message::MessageStatus;
use crate::pairing::{self, PairingManager};
use crate::relay::SigningRelay;
use crate::session::GatewaySession;
use crate::status_cache::{self, MessageStatusCache, RecordOutcome};
use crate::store::IdentityStore;
use crate::transport::{Gateway, SigningBackend, DEFAULT_REQUEST_TIMEOUT};
use crate::trust::{RefreshPolicy, TrustStore};
use crate::types::{DeviceIdentity, MsgId};
use crate::verify::MessageVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unpaired,
    Pairing,
    Running,
}

/// Source of pairing tokens, normally an operator at a terminal.
#[async_trait]
pub trait PairingPrompt: Send + Sync {
    /// The token for attempt `attempt` (starting at 1), or `None` to give
    /// up. `last_error` explains why the previous attempt failed.
    async fn next_token(&self, attempt: u32, last_error: Option<&PairingError>) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub ingest_interval: Duration,
    pub status_poll_interval: Duration,
    pub request_timeout: Duration,
    pub status_cache_capacity: usize,
    pub certificate_refresh: RefreshPolicy,
    /// Device id to pair under; generated when absent.
    pub device_id: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            ingest_interval: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(30),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            status_cache_capacity: status_cache::DEFAULT_CAPACITY,
            certificate_refresh: RefreshPolicy::Forever,
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub dispatched: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub updated: usize,
    pub reported: usize,
    pub report_failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ingest: IngestReport,
    pub poll: PollReport,
}

pub struct AgentLoop {
    state: watch::Sender<AgentState>,
    pairing: PairingManager,
    session: Arc<GatewaySession>,
    verifier: MessageVerifier,
    relay: SigningRelay,
    cache: Arc<MessageStatusCache>,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        backend: Arc<dyn SigningBackend>,
        identity: Arc<dyn IdentityStore>,
        settings: AgentSettings,
    ) -> Self {
        let timeout = settings.request_timeout;
        let session = Arc::new(GatewaySession::new(gateway.clone(), identity.clone(), timeout));
        let trust = Arc::new(TrustStore::new(session.clone(), settings.certificate_refresh));
        let (state, _) = watch::channel(AgentState::Unpaired);

        Self {
            state,
            pairing: PairingManager::new(gateway, identity, timeout),
            relay: SigningRelay::new(backend, session.clone(), timeout),
            cache: Arc::new(MessageStatusCache::new(settings.status_cache_capacity)),
            session,
            verifier: MessageVerifier::new(trust),
            settings,
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.pairing
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        self.verifier.trust_store()
    }

    pub fn status_cache(&self) -> &Arc<MessageStatusCache> {
        &self.cache
    }

    pub fn session(&self) -> &Arc<GatewaySession> {
        &self.session
    }

    /// Make sure a device identity exists, pairing through `prompt` if not.
    pub async fn ensure_paired(&self, prompt: &dyn PairingPrompt) -> Result<DeviceIdentity, PairingError> {
        if let Some(identity) = self.pairing.identity().await? {
            self.state.send_replace(AgentState::Running);
            return Ok(identity);
        }

        self.state.send_replace(AgentState::Pairing);
        let device_id = match &self.settings.device_id {
            Some(id) => id.clone(),
            None => pairing::generate_device_id()?,
        };

        let mut attempt = 0;
        let mut last_error: Option<PairingError> = None;
        loop {
            attempt += 1;
            let Some(token) = prompt.next_token(attempt, last_error.as_ref()).await else {
                self.state.send_replace(AgentState::Unpaired);
                return Err(last_error
                    .unwrap_or_else(|| PairingError::InvalidToken("no pairing token provided".into())));
            };

            if !pairing::is_valid_pairing_token(&token) {
                warn!(attempt, "pairing token is not structurally valid");
                last_error = Some(PairingError::InvalidToken("token carries no userId".into()));
                continue;
            }

            match self.pairing.pair_device(&token, &device_id).await {
                Ok(identity) => {
                    self.state.send_replace(AgentState::Running);
                    return Ok(identity);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "pairing attempt failed");
                    last_error = Some(e);
                }
            }
        }
    }

    /// Fetch, verify, and dispatch new envelopes.
    ///
    /// A message that fails verification is dropped and logged. Transport
    /// failures abort the step.
    pub async fn ingest(&self) -> Result<IngestReport, CoreError> {
        // A cold trust store that cannot be filled aborts the step here.
        self.verifier.trust_store().certificates().await?;
        let envelopes = self.session.messages().await?;

        let mut report = IngestReport {
            received: envelopes.len(),
            ..IngestReport::default()
        };
        let mut verified = Vec::with_capacity(envelopes.len());
        let mut seen: HashSet<MsgId> = HashSet::with_capacity(envelopes.len());
        for envelope in &envelopes {
            if !seen.insert(envelope.msg_id) || self.cache.contains(envelope.msg_id).await {
                debug!(msg_id = %envelope.msg_id, "skipping message already in flight");
                report.duplicates += 1;
                continue;
            }
            match self.verifier.verify(envelope).await {
                Ok(message) => verified.push(message),
                Err(e) if e.is_message_local() => {
                    warn!(msg_id = %envelope.msg_id, error = %e, "dropping message that failed verification");
                    report.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if verified.is_empty() {
            return Ok(report);
        }
        for status in self.relay.dispatch(&verified).await? {
            debug!(msg_id = %status.msg_id, status = ?status.kind(), "message dispatched");
            self.cache.record_dispatched(status).await;
            report.dispatched += 1;
        }
        info!(
            received = report.received,
            dispatched = report.dispatched,
            rejected = report.rejected,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Refresh pending statuses from the backend, then report every
    /// terminal status the gateway has not yet seen.
    pub async fn poll_statuses(&self) -> Result<PollReport, CoreError> {
        let mut report = PollReport::default();

        let pending = self.cache.pending_ids().await;
        let fetched = self.relay.fetch_status(&pending).await;
        if let Ok(statuses) = &fetched {
            for status in statuses {
                let outcome = self.cache.record_result(status.clone()).await;
                if matches!(outcome, RecordOutcome::Inserted | RecordOutcome::Updated) {
                    report.updated += 1;
                }
            }
        }

        for status in self.cache.unreported().await {
            match self.report(&status).await {
                Ok(()) => {
                    self.cache.mark_reported(status.msg_id).await;
                    report.reported += 1;
                }
                Err(e) => {
                    warn!(msg_id = %status.msg_id, error = %e, "reporting result failed, will retry");
                    report.report_failures += 1;
                }
            }
        }

        fetched?;
        Ok(report)
    }

    async fn report(&self, status: &MessageStatus) -> Result<(), CoreError> {
        self.relay.broadcast_result(status).await?;
        self.relay.acknowledge(status.msg_id).await?;
        info!(msg_id = %status.msg_id, status = ?status.kind(), "result delivered");
        Ok(())
    }

    /// One ingestion step followed by one status poll.
    pub async fn run_cycle(&self) -> Result<CycleReport, CoreError> {
        let ingest = self.ingest().await?;
        let poll = self.poll_statuses().await?;
        Ok(CycleReport { ingest, poll })
    }

    /// Drive both timers until `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            ingest_interval = ?self.settings.ingest_interval,
            status_poll_interval = ?self.settings.status_poll_interval,
            "agent loop started"
        );
        tokio::join!(
            self.every(self.settings.ingest_interval, shutdown.clone(), Step::Ingest),
            self.every(self.settings.status_poll_interval, shutdown, Step::Poll),
        );
        info!("agent loop stopped");
    }

    async fn every(&self, period: Duration, mut shutdown: watch::Receiver<bool>, step: Step) {
        if *shutdown.borrow() {
            return;
        }
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let result = match step {
                        Step::Ingest => self.ingest().await.map(|_| ()),
                        Step::Poll => self.poll_statuses().await.map(|_| ()),
                    };
                    if let Err(e) = result {
                        warn!(step = ?step, error = %e, "step failed, retrying next tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Ingest,
    Poll,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{
        pairing_token, structured_envelope, test_identity, MessageBuilder, MockGateway, MockSigningBackend,
        ScriptedPrompt,
    };
    use crate::message::StatusKind;
    use crate::store::InMemoryIdentityStore;
    use crate::types::MsgId;

    struct Fixture {
        gateway: Arc<MockGateway>,
        backend: Arc<MockSigningBackend>,
        agent: AgentLoop,
    }

    fn paired() -> Fixture {
        fixture(Arc::new(InMemoryIdentityStore::with_identity(test_identity())))
    }

    fn fixture(store: Arc<InMemoryIdentityStore>) -> Fixture {
        let gateway = Arc::new(MockGateway::with_fixture_certificates());
        let backend = Arc::new(MockSigningBackend::new());
        let agent = AgentLoop::new(gateway.clone(), backend.clone(), store, AgentSettings::default());
        Fixture {
            gateway,
            backend,
            agent,
        }
    }

    #[tokio::test]
    async fn test_already_paired_goes_straight_to_running() {
        let f = paired();
        let prompt = ScriptedPrompt::new(Vec::<String>::new());
        f.agent.ensure_paired(&prompt).await.unwrap();
        assert_eq!(f.agent.state(), AgentState::Running);
        assert_eq!(prompt.asked(), 0);
    }

    #[tokio::test]
    async fn test_pairing_reprompts_after_rejection() {
        let f = fixture(Arc::new(InMemoryIdentityStore::new()));
        f.gateway.reject_pairing_tokens([pairing_token("user-bad").unwrap()]).await;
        let prompt = ScriptedPrompt::new([
            pairing_token("").unwrap(),
            pairing_token("user-bad").unwrap(),
            pairing_token("user-1").unwrap(),
        ]);

        let identity = f.agent.ensure_paired(&prompt).await.unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(f.agent.state(), AgentState::Running);
        assert_eq!(prompt.asked(), 3);
        // the empty-userId token never reached the gateway
        assert_eq!(f.gateway.pair_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn test_pairing_gives_up_when_prompt_does() {
        let f = fixture(Arc::new(InMemoryIdentityStore::new()));
        f.gateway.reject_pairing(true);
        let prompt = ScriptedPrompt::new([pairing_token("user-1").unwrap()]);

        let err = f.agent.ensure_paired(&prompt).await.unwrap_err();
        assert!(matches!(err, PairingError::PairingRejected(_)));
        assert_eq!(f.agent.state(), AgentState::Unpaired);
    }

    #[tokio::test]
    async fn test_cycle_dispatches_and_reports() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;

        let report = f.agent.run_cycle().await.unwrap();
        assert_eq!(report.ingest.dispatched, 1);
        assert_eq!(f.agent.status_cache().pending_ids().await, vec![MsgId(1)]);

        f.backend.resolve_signed(MsgId(1), "c2lnbmVk").await;
        let poll = f.agent.poll_statuses().await.unwrap();
        assert_eq!(poll, PollReport { updated: 1, reported: 1, report_failures: 0 });
        assert_eq!(f.gateway.acknowledged().await, vec![MsgId(1)]);
        assert_eq!(f.gateway.broadcasts().await[0].status, StatusKind::Signed);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_not_dispatched_twice() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;

        f.agent.ingest().await.unwrap();
        let second = f.agent.ingest().await.unwrap();
        assert_eq!(second.duplicates, 1);
        assert_eq!(f.backend.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_msg_id_within_one_batch_is_dispatched_once() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;

        let report = f.agent.ingest().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(f.backend.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_outage_does_not_lose_messages() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;

        f.backend.set_offline(true);
        assert!(f.agent.run_cycle().await.is_err());
        assert!(f.agent.status_cache().is_empty().await);

        f.backend.set_offline(false);
        assert_eq!(f.agent.ingest().await.unwrap().dispatched, 1);
    }

    #[tokio::test]
    async fn test_failed_broadcast_is_retried() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;
        f.agent.ingest().await.unwrap();
        f.backend.resolve_failed(MsgId(1), "hsm offline").await;

        f.gateway.fail_broadcasts(true);
        let first = f.agent.poll_statuses().await.unwrap();
        assert_eq!(first.report_failures, 1);
        assert!(f.gateway.acknowledged().await.is_empty());

        f.gateway.fail_broadcasts(false);
        let second = f.agent.poll_statuses().await.unwrap();
        assert_eq!(second.reported, 1);
        assert_eq!(f.gateway.acknowledged().await, vec![MsgId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = paired();
        let signed = MessageBuilder::tx_sign("tx-1").build().unwrap();
        f.gateway.deliver(structured_envelope(MsgId(1), &signed)).await;

        let (tx, rx) = watch::channel(false);
        let agent = Arc::new(f.agent);
        let task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.backend.submitted().await.len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
