//! In-memory queue store
//!
//! Explicit, injectable state: every instance is an isolated queue, so
//! tests can run many of them side by side. Nothing survives a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::activity::QueueMessage;
use super::store::{Lease, QueueCounts, QueueState, QueueStore, StoredMessage};
use crate::error::AppError;

#[derive(Debug, Clone)]
struct Entry {
    /// Publish order; requeueing moves a message to the back
    seq: u64,
    state: QueueState,
    message: QueueMessage,
    lease_id: Option<String>,
    lease_expires_at: Option<Instant>,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        match self.state {
            QueueState::Queued => true,
            QueueState::Processing => self.lease_expires_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.state == QueueState::Processing
            && self.lease_id.as_deref() == Some(lease.lease_id.as_str())
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Queue store held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn settle(&self, lease: &Lease, to: Option<QueueState>) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&lease.message_id) else {
            return false;
        };
        if !entry.holds(lease) {
            return false;
        }

        match to {
            Some(state) => {
                entry.state = state;
                entry.lease_id = None;
                entry.lease_expires_at = None;
            }
            None => {
                inner.entries.remove(&lease.message_id);
            }
        }
        true
    }
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, message: &QueueMessage) -> Result<String, AppError> {
        let message_id = ulid::Ulid::new().to_string();
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        inner.entries.insert(
            message_id.clone(),
            Entry {
                seq,
                state: QueueState::Queued,
                message: message.clone(),
                lease_id: None,
                lease_expires_at: None,
            },
        );
        Ok(message_id)
    }

    async fn pop(&self, visibility: Duration) -> Result<Option<Lease>, AppError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let Some(message_id) = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_visible(now))
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| id.clone())
        else {
            return Ok(None);
        };

        let lease_id = ulid::Ulid::new().to_string();
        let Some(entry) = inner.entries.get_mut(&message_id) else {
            return Ok(None);
        };
        entry.state = QueueState::Processing;
        entry.lease_id = Some(lease_id.clone());
        // A lease too long to represent never expires
        entry.lease_expires_at = now.checked_add(visibility);

        Ok(Some(Lease {
            message_id,
            lease_id,
            message: entry.message.clone(),
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, AppError> {
        Ok(self.settle(lease, None).await)
    }

    async fn fail(&self, lease: &Lease) -> Result<bool, AppError> {
        Ok(self.settle(lease, Some(QueueState::Failed)).await)
    }

    async fn dead_letter(&self, lease: &Lease) -> Result<bool, AppError> {
        Ok(self.settle(lease, Some(QueueState::Dead)).await)
    }

    async fn requeue(
        &self,
        message_id: &str,
        from: QueueState,
        message: &QueueMessage,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let Some(entry) = inner.entries.get_mut(message_id) else {
            return Ok(false);
        };
        if entry.state != from {
            return Ok(false);
        }

        entry.seq = seq;
        entry.state = QueueState::Queued;
        entry.message = message.clone();
        entry.lease_id = None;
        entry.lease_expires_at = None;
        Ok(true)
    }

    async fn bury(&self, message_id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(message_id) {
            Some(entry) if entry.state == QueueState::Failed => {
                entry.state = QueueState::Dead;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, state: QueueState) -> Result<Vec<StoredMessage>, AppError> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<(&String, &Entry)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == state)
            .collect();
        matching.sort_by_key(|(_, entry)| entry.seq);

        Ok(matching
            .into_iter()
            .map(|(id, entry)| StoredMessage {
                message_id: id.clone(),
                state: entry.state,
                message: entry.message.clone(),
            })
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for entry in inner.entries.values() {
            match entry.state {
                QueueState::Queued => counts.queued += 1,
                QueueState::Processing => counts.processing += 1,
                QueueState::Failed => counts.failed += 1,
                QueueState::Dead => counts.dead += 1,
                QueueState::Delivered => {}
            }
        }
        Ok(counts)
    }
}
