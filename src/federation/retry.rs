//! Scheduled retry sweeps
//!
//! Moves failed deliveries back into the outbound queue on a fixed interval
//! and dead-letters the ones whose retry budget is spent.

use std::time::Duration;

use tokio::time;

use crate::error::AppError;
use crate::queue::{ActivityQueue, RetrySweep};

/// Background task that periodically runs the failed-queue sweep
pub struct RetrySweeper {
    queue: ActivityQueue,
    interval: Duration,
}

impl RetrySweeper {
    /// Create a new sweeper
    ///
    /// # Arguments
    /// * `queue` - Queue whose failed messages are swept
    /// * `interval` - How often to sweep (e.g., every 5 minutes)
    pub fn new(queue: ActivityQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Run a single sweep and log the queue depth afterwards
    pub async fn sweep_once(&self) -> Result<RetrySweep, AppError> {
        let sweep = self.queue.retry_failed_activities().await?;

        if sweep.retried > 0 || sweep.dead_lettered > 0 {
            tracing::info!(
                retried = sweep.retried,
                dead_lettered = sweep.dead_lettered,
                "Retry sweep finished"
            );
        } else {
            tracing::debug!("No failed activities to retry");
        }

        match self.queue.counts().await {
            Ok(counts) => tracing::debug!(
                queued = counts.queued,
                processing = counts.processing,
                failed = counts.failed,
                dead = counts.dead,
                "Current activity queue depth"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to read activity queue depth"),
        }

        Ok(sweep)
    }

    /// Start the sweep loop
    ///
    /// Runs until the task is aborted. The first sweep happens one full
    /// interval after start.
    pub async fn run(self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Starting retry sweeper"
        );

        let mut interval = time::interval_at(time::Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Retry sweep failed");
            }
        }
    }
}
