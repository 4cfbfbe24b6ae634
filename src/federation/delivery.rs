//! Activity delivery
//!
//! Pulls queued activities one at a time and POSTs them, signed, to the
//! destination inbox. Any outcome other than success parks the message in
//! the failed queue for the retry sweeper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::signature::{LocalActorKey, sign_request};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};
use crate::queue::{ActivityQueue, ProcessedMessage, QueueMessage};

/// Default `User-Agent` for outbound deliveries
pub const DEFAULT_USER_AGENT: &str = concat!("fedcourier/", env!("CARGO_PKG_VERSION"));

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    fn failed(inbox_uri: impl Into<String>, status_code: Option<u16>, error: String) -> Self {
        Self {
            inbox_uri: inbox_uri.into(),
            success: false,
            status_code,
            error: Some(error),
        }
    }
}

/// Signed activity delivery
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    key: Arc<LocalActorKey>,
    accept_any_2xx: bool,
}

impl ActivityDelivery {
    /// Create new delivery service
    ///
    /// # Arguments
    /// * `key` - The queue-owning actor's signing key
    /// * `timeout` - Bound on each attempt; a timeout counts as a failure
    /// * `user_agent` - Sent on every request
    /// * `accept_any_2xx` - Treat every 2xx as success instead of only 200
    pub fn new(
        key: Arc<LocalActorKey>,
        timeout: Duration,
        user_agent: &str,
        accept_any_2xx: bool,
    ) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            key,
            accept_any_2xx,
        })
    }

    fn is_success(&self, status: reqwest::StatusCode) -> bool {
        if self.accept_any_2xx {
            status.is_success()
        } else {
            status == reqwest::StatusCode::OK
        }
    }

    /// Deliver a queued activity to its inbox
    ///
    /// Never returns an error: every failure is reported in the result so
    /// the caller can route it to the failed queue.
    pub async fn deliver_to_inbox(&self, message: &QueueMessage) -> DeliveryResult {
        let activity = &message.activity;
        let started = Instant::now();
        let result = match self.try_deliver(message).await {
            Ok(result) | Err(result) => result,
        };

        let outcome = if result.success { "success" } else { "failure" };
        DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        if result.success {
            tracing::info!(
                activity_id = %activity.id,
                inbox = %result.inbox_uri,
                "Successfully delivered activity"
            );
        } else {
            tracing::warn!(
                activity_id = %activity.id,
                inbox = %result.inbox_uri,
                status = ?result.status_code,
                error = result.error.as_deref().unwrap_or_default(),
                "Delivery attempt failed"
            );
        }
        result
    }

    async fn try_deliver(&self, message: &QueueMessage) -> Result<DeliveryResult, DeliveryResult> {
        // 1. Resolve inbox before signing; the signing string is path-specific
        let inbox = message.inbox_url().map_err(|e| {
            DeliveryResult::failed(message.delivery_target.clone(), None, e.to_string())
        })?;
        let inbox_uri = inbox.to_string();

        // 2. Serialize activity; queue metadata stays out of the body
        let body = serde_json::to_vec(&message.activity)
            .map_err(|e| DeliveryResult::failed(&inbox_uri, None, e.to_string()))?;

        // 3. Sign request
        let sig_headers = sign_request(&self.key, "POST", &inbox, Some(&body))
            .map_err(|e| DeliveryResult::failed(&inbox_uri, None, e.to_string()))?;

        // 4. POST to inbox with signed headers
        let request = self
            .http_client
            .post(inbox)
            .header("Content-Type", "application/activity+json")
            .header("Accept", "application/activity+json");
        let response = sig_headers
            .apply(request)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("Timed out delivering to {}", inbox_uri)
                } else {
                    format!("Failed to deliver to {}: {}", inbox_uri, e)
                };
                DeliveryResult::failed(&inbox_uri, None, reason)
            })?;

        // 5. Classify response
        let status = response.status();
        if !self.is_success(status) {
            return Err(DeliveryResult::failed(
                &inbox_uri,
                Some(status.as_u16()),
                format!("Inbox {} rejected activity: HTTP {}", inbox_uri, status),
            ));
        }

        Ok(DeliveryResult {
            inbox_uri,
            success: true,
            status_code: Some(status.as_u16()),
            error: None,
        })
    }
}

/// Pull-based delivery consumer
///
/// Leases exactly one message at a time. Run several workers against the
/// same queue to scale out; the lease guarantees one active consumer per
/// message.
#[derive(Clone)]
pub struct DeliveryWorker {
    id: usize,
    queue: ActivityQueue,
    delivery: ActivityDelivery,
    idle_poll: Duration,
}

impl DeliveryWorker {
    pub fn new(
        id: usize,
        queue: ActivityQueue,
        delivery: ActivityDelivery,
        idle_poll: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            delivery,
            idle_poll,
        }
    }

    /// Deliver one queued message, if any
    pub async fn run_once(&self) -> Result<Option<ProcessedMessage>, AppError> {
        let delivery = &self.delivery;
        self.queue
            .process_next(|message| async move {
                delivery.deliver_to_inbox(&message).await.success
            })
            .await
    }

    /// Deliver until the queue has nothing deliverable
    pub async fn drain(&self) -> Result<Vec<ProcessedMessage>, AppError> {
        let mut processed = Vec::new();
        while let Some(message) = self.run_once().await? {
            processed.push(message);
        }
        Ok(processed)
    }

    /// Consume until `shutdown` is set
    ///
    /// Sleeps `idle_poll` whenever the queue is empty or the store errors.
    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        tracing::info!(worker = self.id, "Delivery worker started");

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(self.idle_poll).await,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Failed to process queue");
                    tokio::time::sleep(self.idle_poll).await;
                }
            }
        }

        tracing::info!(worker = self.id, "Delivery worker stopped");
    }
}
