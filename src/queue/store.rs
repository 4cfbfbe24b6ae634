//! Queue store interface
//!
//! A store keeps every message in exactly one state. Implementations exist
//! for SQLite ([`super::SqliteQueueStore`]) and for process memory
//! ([`super::MemoryQueueStore`]); anything offering the same transitions
//! (a broker, an embedded log) can slot in behind this trait.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::activity::QueueMessage;
use crate::error::AppError;

/// Lifecycle state of a queued message
///
/// `Delivered` is terminal and never stored: acknowledging a message
/// removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Queued,
    Processing,
    Failed,
    Dead,
    Delivered,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Processing => "processing",
            QueueState::Failed => "failed",
            QueueState::Dead => "dead",
            QueueState::Delivered => "delivered",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueState::Queued),
            "processing" => Ok(QueueState::Processing),
            "failed" => Ok(QueueState::Failed),
            "dead" => Ok(QueueState::Dead),
            "delivered" => Ok(QueueState::Delivered),
            other => Err(AppError::Validation(format!(
                "Unknown queue state: {}",
                other
            ))),
        }
    }
}

/// A message as held by the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub state: QueueState,
    pub message: QueueMessage,
}

/// Exclusive claim on a `Processing` message
///
/// Only the holder of the current lease may settle the message. Once the
/// visibility timeout passes the message can be leased again, and the old
/// lease stops matching.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub message_id: String,
    pub lease_id: String,
    pub message: QueueMessage,
}

/// Number of messages per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: u64,
    pub processing: u64,
    pub failed: u64,
    pub dead: u64,
}

/// Durable message store behind [`super::ActivityQueue`]
///
/// Transitions that take a message id or lease return `false` when the
/// message is no longer in the expected state (or the lease was lost), so
/// competing workers and sweepers never double-settle a message.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Durably append a message in `Queued`; returns its message id
    async fn push(&self, message: &QueueMessage) -> Result<String, AppError>;

    /// Lease the oldest visible `Queued` message (or a `Processing` one whose
    /// lease expired) for `visibility`
    async fn pop(&self, visibility: Duration) -> Result<Option<Lease>, AppError>;

    /// `Processing` -> removed (delivered)
    async fn ack(&self, lease: &Lease) -> Result<bool, AppError>;

    /// `Processing` -> `Failed`
    async fn fail(&self, lease: &Lease) -> Result<bool, AppError>;

    /// `Processing` -> `Dead`
    async fn dead_letter(&self, lease: &Lease) -> Result<bool, AppError>;

    /// `from` -> `Queued`, replacing the stored payload with `message`
    async fn requeue(
        &self,
        message_id: &str,
        from: QueueState,
        message: &QueueMessage,
    ) -> Result<bool, AppError>;

    /// `Failed` -> `Dead`
    async fn bury(&self, message_id: &str) -> Result<bool, AppError>;

    /// All messages currently in `state`, oldest first
    async fn list(&self, state: QueueState) -> Result<Vec<StoredMessage>, AppError>;

    /// Per-state message counts
    async fn counts(&self) -> Result<QueueCounts, AppError>;
}

