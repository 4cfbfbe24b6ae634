//! Outbound activity queue
//!
//! State machine over a [`QueueStore`]:
//!
//! ```text
//! enqueue ──► QUEUED ──pop──► PROCESSING ──ok──► DELIVERED (removed)
//!               ▲                 │
//!               │ sweep           └──err──► FAILED ──sweep, budget spent──► DEAD
//!               └─────────────────────────────┘
//! ```
//!
//! `retry_count` only grows on a sweep; a first failure parks the message
//! with `retry_count == 0`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::activity::{Activity, QueueMessage, resolve_inbox_url};
use super::memory::MemoryQueueStore;
use super::store::{Lease, QueueCounts, QueueState, QueueStore, StoredMessage};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_ENQUEUED, QUEUE_TRANSITIONS_TOTAL, RETRY_SWEEP_TOTAL};

/// Default number of sweeps a failed message is retried before dead-lettering
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Queue tuning
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Retry budget per message
    pub max_retries: u32,
    /// How long a popped message stays invisible to other workers
    pub visibility_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// How a delivery attempt settled its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledged and removed
    Delivered,
    /// Parked in the failed queue for a later sweep
    Failed,
    /// Retry budget already spent; parked for an operator
    DeadLettered,
    /// Lease expired before the attempt finished; another worker owns it now
    LeaseLost,
}

/// Result of processing one queued message
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub activity_id: String,
    pub retry_count: u32,
    pub outcome: DeliveryOutcome,
}

/// Result of one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    /// Messages moved back to the outbound queue
    pub retried: usize,
    /// Messages moved to the dead-letter state
    pub dead_lettered: usize,
}

/// Durable outbound activity queue
#[derive(Clone)]
pub struct ActivityQueue {
    store: Arc<dyn QueueStore>,
    settings: QueueSettings,
}

impl ActivityQueue {
    pub fn new(store: Arc<dyn QueueStore>, settings: QueueSettings) -> Self {
        Self { store, settings }
    }

    /// Isolated queue held in process memory
    pub fn in_memory(settings: QueueSettings) -> Self {
        Self::new(Arc::new(MemoryQueueStore::new()), settings)
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Queue an activity for delivery to `delivery_target`
    ///
    /// The target is an inbox URL or a base URL that `/inbox` is appended
    /// to. Stamps `queued_at`, resets `retry_count` to 0 and performs one
    /// durable write. Never touches the network.
    ///
    /// # Errors
    /// - `Validation` if the activity lacks a required field or the target
    ///   is not an http(s) URL
    /// - `QueueUnavailable` if the store cannot be written
    pub async fn enqueue(
        &self,
        activity: Activity,
        delivery_target: &str,
    ) -> Result<String, AppError> {
        activity.validate()?;
        resolve_inbox_url(delivery_target)?;

        let message = QueueMessage::new(activity, delivery_target);
        let message_id = self.store.push(&message).await.map_err(|e| {
            tracing::error!(
                activity_id = %message.activity.id,
                error = %e,
                "Failed to queue activity"
            );
            e
        })?;

        ACTIVITIES_ENQUEUED
            .with_label_values(&[message.activity.kind.as_str()])
            .inc();
        tracing::info!(
            activity_id = %message.activity.id,
            message_id = %message_id,
            "Queued activity for delivery"
        );

        Ok(message_id)
    }

    /// Lease the next deliverable message, if any
    pub async fn lease_next(&self) -> Result<Option<Lease>, AppError> {
        let lease = self.store.pop(self.settings.visibility_timeout).await?;
        if let Some(lease) = &lease {
            QUEUE_TRANSITIONS_TOTAL
                .with_label_values(&[QueueState::Processing.as_str()])
                .inc();
            tracing::debug!(
                activity_id = %lease.message.activity.id,
                message_id = %lease.message_id,
                retry_count = lease.message.retry_count,
                "Leased activity for delivery"
            );
        }
        Ok(lease)
    }

    /// Settle a leased message after a delivery attempt
    pub async fn complete(
        &self,
        lease: &Lease,
        delivered: bool,
    ) -> Result<DeliveryOutcome, AppError> {
        let (settled, outcome) = if delivered {
            (self.store.ack(lease).await?, DeliveryOutcome::Delivered)
        } else if lease.message.is_exhausted(self.settings.max_retries) {
            (
                self.store.dead_letter(lease).await?,
                DeliveryOutcome::DeadLettered,
            )
        } else {
            (self.store.fail(lease).await?, DeliveryOutcome::Failed)
        };

        if !settled {
            tracing::warn!(
                activity_id = %lease.message.activity.id,
                message_id = %lease.message_id,
                "Lease expired before delivery finished; leaving message to its new owner"
            );
            return Ok(DeliveryOutcome::LeaseLost);
        }

        let to_state = match outcome {
            DeliveryOutcome::Delivered => QueueState::Delivered,
            DeliveryOutcome::Failed => QueueState::Failed,
            _ => QueueState::Dead,
        };
        QUEUE_TRANSITIONS_TOTAL
            .with_label_values(&[to_state.as_str()])
            .inc();

        match outcome {
            DeliveryOutcome::Delivered => tracing::info!(
                activity_id = %lease.message.activity.id,
                "Successfully processed activity"
            ),
            DeliveryOutcome::Failed => tracing::warn!(
                activity_id = %lease.message.activity.id,
                retry_count = lease.message.retry_count,
                "Delivery failed; moved to failed queue"
            ),
            _ => tracing::error!(
                activity_id = %lease.message.activity.id,
                retry_count = lease.message.retry_count,
                "Delivery failed with retries exhausted; moved to dead-letter"
            ),
        }

        Ok(outcome)
    }

    /// Lease one message, hand it to `deliver`, and settle it
    ///
    /// `deliver` returns `true` on success. Returns `None` when nothing is
    /// deliverable.
    pub async fn process_next<F, Fut>(
        &self,
        deliver: F,
    ) -> Result<Option<ProcessedMessage>, AppError>
    where
        F: FnOnce(QueueMessage) -> Fut,
        Fut: Future<Output = bool>,
    {
        let Some(lease) = self.lease_next().await? else {
            return Ok(None);
        };

        let delivered = deliver(lease.message.clone()).await;
        let outcome = self.complete(&lease, delivered).await?;

        Ok(Some(ProcessedMessage {
            message_id: lease.message_id,
            activity_id: lease.message.activity.id,
            retry_count: lease.message.retry_count,
            outcome,
        }))
    }

    /// Move eligible failed messages back to the outbound queue
    ///
    /// Messages under the retry budget get `retry_count + 1` and a fresh
    /// `last_retry`; messages at the budget move to the dead-letter state
    /// and are never retried automatically again.
    pub async fn retry_failed_activities(&self) -> Result<RetrySweep, AppError> {
        let failed = self.store.list(QueueState::Failed).await?;
        let mut sweep = RetrySweep::default();

        for StoredMessage {
            message_id,
            message,
            ..
        } in failed
        {
            if message.is_exhausted(self.settings.max_retries) {
                if self.store.bury(&message_id).await? {
                    sweep.dead_lettered += 1;
                    RETRY_SWEEP_TOTAL.with_label_values(&["dead_lettered"]).inc();
                    tracing::error!(
                        activity_id = %message.activity.id,
                        retry_count = message.retry_count,
                        "Retries exhausted; activity moved to dead-letter"
                    );
                }
                continue;
            }

            let retried = message.retried(Utc::now());
            if self
                .store
                .requeue(&message_id, QueueState::Failed, &retried)
                .await?
            {
                sweep.retried += 1;
                RETRY_SWEEP_TOTAL.with_label_values(&["retried"]).inc();
                tracing::info!(
                    activity_id = %retried.activity.id,
                    retry_count = retried.retry_count,
                    "Retrying failed activity"
                );
            }
        }

        Ok(sweep)
    }

    /// Manually replay a dead-lettered message with a fresh retry budget
    pub async fn replay_dead(&self, message_id: &str) -> Result<bool, AppError> {
        let Some(stored) = self
            .store
            .list(QueueState::Dead)
            .await?
            .into_iter()
            .find(|stored| stored.message_id == message_id)
        else {
            return Ok(false);
        };

        let replayed = QueueMessage {
            retry_count: 0,
            last_retry: Some(Utc::now()),
            ..stored.message
        };
        let moved = self
            .store
            .requeue(message_id, QueueState::Dead, &replayed)
            .await?;

        if moved {
            tracing::info!(
                activity_id = %replayed.activity.id,
                message_id = %message_id,
                "Replayed dead-lettered activity"
            );
        }
        Ok(moved)
    }

    /// Messages waiting for a retry sweep
    pub async fn failed(&self) -> Result<Vec<StoredMessage>, AppError> {
        self.store.list(QueueState::Failed).await
    }

    /// Messages whose retries are exhausted
    pub async fn dead(&self) -> Result<Vec<StoredMessage>, AppError> {
        self.store.list(QueueState::Dead).await
    }

    /// Messages in any state
    pub async fn list(&self, state: QueueState) -> Result<Vec<StoredMessage>, AppError> {
        self.store.list(state).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, AppError> {
        self.store.counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::MockQueueStore;

    const INBOX: &str = "https://remote.example/users/alice/inbox";

    fn activity(n: u32) -> Activity {
        Activity::new(
            format!("https://local.example/activities/{}", n),
            "Create",
            "https://local.example/users/beebo",
            serde_json::json!({"type": "Note", "content": "hello"}),
        )
    }

    async fn fail_everything(queue: &ActivityQueue) -> usize {
        let mut attempts = 0;
        while queue
            .process_next(|_| async { false })
            .await
            .unwrap()
            .is_some()
        {
            attempts += 1;
        }
        attempts
    }

    #[tokio::test]
    async fn enqueue_stamps_metadata_and_writes_queued_message() {
        let queue = ActivityQueue::in_memory(QueueSettings::default());
        let before = Utc::now();
        queue.enqueue(activity(1), INBOX).await.unwrap();

        let queued = queue.list(QueueState::Queued).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message.retry_count, 0);
        assert!(queued[0].message.queued_at >= before);
        assert!(queued[0].message.last_retry.is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_or_invalid_target() {
        let queue = ActivityQueue::in_memory(QueueSettings::default());

        for target in ["", "ftp://remote.example/inbox", "not a url"] {
            assert!(matches!(
                queue.enqueue(activity(1), target).await,
                Err(AppError::Validation(_))
            ));
        }
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn enqueue_propagates_store_outage() {
        let mut store = MockQueueStore::new();
        store
            .expect_push()
            .times(1)
            .returning(|_| Err(AppError::QueueUnavailable(sqlx::Error::PoolClosed)));
        let queue = ActivityQueue::new(Arc::new(store), QueueSettings::default());

        assert!(matches!(
            queue.enqueue(activity(1), INBOX).await,
            Err(AppError::QueueUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn successful_delivery_removes_message() {
        let queue = ActivityQueue::in_memory(QueueSettings::default());
        queue.enqueue(activity(1), INBOX).await.unwrap();

        let processed = queue
            .process_next(|message| async move {
                assert_eq!(message.activity.kind, "Create");
                true
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(processed.outcome, DeliveryOutcome::Delivered);
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn first_failure_parks_message_without_counting_a_retry() {
        let queue = ActivityQueue::in_memory(QueueSettings::default());
        queue.enqueue(activity(1), INBOX).await.unwrap();

        assert_eq!(fail_everything(&queue).await, 1);

        let failed = queue.failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message.retry_count, 0);
        assert_eq!(queue.counts().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn three_sweeps_exhaust_budget_and_fourth_sweep_leaves_it_dead() {
        let queue = ActivityQueue::in_memory(QueueSettings::default());
        queue.enqueue(activity(1), INBOX).await.unwrap();
        fail_everything(&queue).await;

        for expected in 1..=3u32 {
            let sweep = queue.retry_failed_activities().await.unwrap();
            assert_eq!(sweep.retried, 1);
            let queued = queue.list(QueueState::Queued).await.unwrap();
            assert_eq!(queued[0].message.retry_count, expected);
            assert!(queued[0].message.last_retry.is_some());
            fail_everything(&queue).await;
        }

        let dead = queue.dead().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.retry_count, 3);

        let fourth = queue.retry_failed_activities().await.unwrap();
        assert_eq!(fourth, RetrySweep::default());
        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.queued, counts.failed, counts.dead), (0, 0, 1));
    }

    #[tokio::test]
    async fn sweep_buries_failed_messages_already_at_the_budget() {
        let queue = ActivityQueue::in_memory(QueueSettings {
            max_retries: 5,
            ..QueueSettings::default()
        });
        queue.enqueue(activity(1), INBOX).await.unwrap();
        fail_everything(&queue).await;
        queue.retry_failed_activities().await.unwrap();
        fail_everything(&queue).await;

        // Same store, smaller budget: the message at retry_count 1 is done.
        let stricter = ActivityQueue::new(
            queue.store.clone(),
            QueueSettings {
                max_retries: 1,
                ..QueueSettings::default()
            },
        );
        let sweep = stricter.retry_failed_activities().await.unwrap();
        assert_eq!(sweep.dead_lettered, 1);
        assert_eq!(stricter.dead().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_dead_resets_retry_budget() {
        let queue = ActivityQueue::in_memory(QueueSettings {
            max_retries: 1,
            ..QueueSettings::default()
        });
        queue.enqueue(activity(1), INBOX).await.unwrap();
        fail_everything(&queue).await;
        queue.retry_failed_activities().await.unwrap();
        fail_everything(&queue).await;

        let dead = queue.dead().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(queue.replay_dead(&dead[0].message_id).await.unwrap());
        assert!(!queue.replay_dead(&dead[0].message_id).await.unwrap());

        let queued = queue.list(QueueState::Queued).await.unwrap();
        assert_eq!(queued[0].message.retry_count, 0);
    }

    #[tokio::test]
    async fn slow_worker_cannot_settle_a_re_leased_message() {
        let queue = ActivityQueue::in_memory(QueueSettings {
            visibility_timeout: Duration::from_millis(10),
            ..QueueSettings::default()
        });
        queue.enqueue(activity(1), INBOX).await.unwrap();

        let stale = queue.lease_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = queue.lease_next().await.unwrap().unwrap();

        assert_eq!(
            queue.complete(&stale, false).await.unwrap(),
            DeliveryOutcome::LeaseLost
        );
        assert_eq!(
            queue.complete(&fresh, true).await.unwrap(),
            DeliveryOutcome::Delivered
        );
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }
}
