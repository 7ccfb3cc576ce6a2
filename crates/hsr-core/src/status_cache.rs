//! In-memory signing status per message.
//!
//! Statuses move from `PENDING_SIGN` to `SIGNED` or `FAILED` and never
//! back. A terminal status is held as unreported until the gateway has
//! both received it and acknowledged the source message. The cache is
//! bounded: past capacity the oldest terminal, reported entries go first.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::message::MessageStatus;
use crate::types::MsgId;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// A pending write for a message that is already terminal.
    IgnoredTerminal,
}

struct Entry {
    status: MessageStatus,
    reported: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<MsgId, Entry>,
    // Insertion order, oldest first.
    order: VecDeque<MsgId>,
}

impl Inner {
    fn evict(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self.order.iter().position(|id| {
                self.entries
                    .get(id)
                    .map_or(true, |e| e.status.is_terminal() && e.reported)
            });
            let Some(idx) = victim else {
                warn!(len = self.entries.len(), capacity, "status cache over capacity with nothing evictable");
                return;
            };
            if let Some(id) = self.order.remove(idx) {
                self.entries.remove(&id);
                debug!(msg_id = %id, "evicted reported status");
            }
        }
    }
}

pub struct MessageStatusCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for MessageStatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageStatusCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record the status returned when a message was handed to the backend.
    pub async fn record_dispatched(&self, status: MessageStatus) -> RecordOutcome {
        self.record(status).await
    }

    /// Record a status reported by the backend. Applied whether or not the
    /// message is currently tracked.
    pub async fn record_result(&self, status: MessageStatus) -> RecordOutcome {
        self.record(status).await
    }

    async fn record(&self, status: MessageStatus) -> RecordOutcome {
        let mut inner = self.inner.lock().await;
        let msg_id = status.msg_id;

        let outcome = match inner.entries.get_mut(&msg_id) {
            Some(entry) if entry.status.is_terminal() && !status.is_terminal() => {
                warn!(msg_id = %msg_id, "ignoring PENDING_SIGN for a message that is already terminal");
                RecordOutcome::IgnoredTerminal
            }
            Some(entry) if entry.status == status => RecordOutcome::Unchanged,
            Some(entry) => {
                entry.status = status;
                entry.reported = false;
                RecordOutcome::Updated
            }
            None => {
                inner.entries.insert(
                    msg_id,
                    Entry {
                        status,
                        reported: false,
                    },
                );
                inner.order.push_back(msg_id);
                RecordOutcome::Inserted
            }
        };

        if outcome == RecordOutcome::Inserted {
            inner.evict(self.capacity);
        }
        outcome
    }

    pub async fn get(&self, msg_id: MsgId) -> Option<MessageStatus> {
        self.inner.lock().await.entries.get(&msg_id).map(|e| e.status.clone())
    }

    pub async fn contains(&self, msg_id: MsgId) -> bool {
        self.inner.lock().await.entries.contains_key(&msg_id)
    }

    /// Ids still waiting on the backend, in insertion order.
    pub async fn pending_ids(&self) -> Vec<MsgId> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter(|id| inner.entries.get(id).is_some_and(|e| !e.status.is_terminal()))
            .copied()
            .collect()
    }

    /// Terminal statuses the gateway has not yet received, in insertion order.
    pub async fn unreported(&self) -> Vec<MessageStatus> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.status.is_terminal() && !e.reported)
            .map(|e| e.status.clone())
            .collect()
    }

    /// Mark a terminal status as delivered. Returns false if the message is
    /// unknown or not terminal.
    pub async fn mark_reported(&self, msg_id: MsgId) -> bool {
        let mut inner = self.inner.lock().await;
        let marked = match inner.entries.get_mut(&msg_id) {
            Some(entry) if entry.status.is_terminal() => {
                entry.reported = true;
                true
            }
            _ => false,
        };
        if marked {
            inner.evict(self.capacity);
        }
        marked
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SigningState;
    use serde_json::json;

    fn pending(id: u64) -> MessageStatus {
        MessageStatus::pending(MsgId(id), format!("r-{id}"), "KEY_LINK_TX_SIGN_REQUEST", json!({}))
    }

    fn signed(id: u64) -> MessageStatus {
        MessageStatus::new(
            MsgId(id),
            format!("r-{id}"),
            "KEY_LINK_TX_SIGN_REQUEST",
            json!({}),
            SigningState::Signed {
                signed_payload: format!("sig-{id}"),
            },
        )
        .unwrap()
    }

    fn failed(id: u64) -> MessageStatus {
        MessageStatus::new(
            MsgId(id),
            format!("r-{id}"),
            "KEY_LINK_TX_SIGN_REQUEST",
            json!({}),
            SigningState::Failed {
                error_message: "hsm refused".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pending_then_signed() {
        let cache = MessageStatusCache::default();
        assert_eq!(cache.record_dispatched(pending(1)).await, RecordOutcome::Inserted);
        assert_eq!(cache.pending_ids().await, vec![MsgId(1)]);

        assert_eq!(cache.record_result(signed(1)).await, RecordOutcome::Updated);
        assert!(cache.pending_ids().await.is_empty());
        assert_eq!(cache.unreported().await, vec![signed(1)]);
    }

    #[tokio::test]
    async fn test_terminal_never_returns_to_pending() {
        let cache = MessageStatusCache::default();
        cache.record_dispatched(pending(1)).await;
        cache.record_result(failed(1)).await;

        assert_eq!(cache.record_dispatched(pending(1)).await, RecordOutcome::IgnoredTerminal);
        assert_eq!(cache.get(MsgId(1)).await, Some(failed(1)));
    }

    #[tokio::test]
    async fn test_terminal_writes_last_one_wins() {
        let cache = MessageStatusCache::default();
        cache.record_result(failed(1)).await;
        assert_eq!(cache.record_result(signed(1)).await, RecordOutcome::Updated);
        assert_eq!(cache.record_result(signed(1)).await, RecordOutcome::Unchanged);
        assert_eq!(cache.get(MsgId(1)).await, Some(signed(1)));
    }

    #[tokio::test]
    async fn test_untracked_result_is_applied() {
        let cache = MessageStatusCache::default();
        assert_eq!(cache.record_result(signed(9)).await, RecordOutcome::Inserted);
        assert_eq!(cache.unreported().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_reported() {
        let cache = MessageStatusCache::default();
        cache.record_dispatched(pending(1)).await;
        assert!(!cache.mark_reported(MsgId(1)).await);
        assert!(!cache.mark_reported(MsgId(2)).await);

        cache.record_result(signed(1)).await;
        assert!(cache.mark_reported(MsgId(1)).await);
        assert!(cache.unreported().await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_skips_pending_and_unreported() {
        let cache = MessageStatusCache::new(2);
        cache.record_dispatched(pending(1)).await;
        cache.record_result(signed(2)).await;
        cache.record_result(signed(3)).await;
        // nothing is both terminal and reported yet
        assert_eq!(cache.len().await, 3);

        cache.mark_reported(MsgId(3)).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.contains(MsgId(1)).await);
        assert!(cache.contains(MsgId(2)).await);
        assert!(!cache.contains(MsgId(3)).await);
    }

    #[tokio::test]
    async fn test_eviction_takes_oldest_reported_first() {
        let cache = MessageStatusCache::new(2);
        for id in 1..=2 {
            cache.record_result(signed(id)).await;
            cache.mark_reported(MsgId(id)).await;
        }
        cache.record_dispatched(pending(3)).await;
        assert!(!cache.contains(MsgId(1)).await);
        assert!(cache.contains(MsgId(2)).await);
        assert!(cache.contains(MsgId(3)).await);
    }
}
