//! SQLite-backed queue store
//!
//! Every transition is a single statement, so a message is never observed
//! half-way between two states. Uses SQLx with the migrations in
//! `./migrations`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use super::activity::QueueMessage;
use super::store::{Lease, QueueCounts, QueueState, QueueStore, StoredMessage};
use crate::error::AppError;

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    message_id: String,
    state: String,
    payload: String,
}

impl QueueRow {
    fn into_stored(self) -> Result<StoredMessage, AppError> {
        Ok(StoredMessage {
            state: self.state.parse()?,
            message: serde_json::from_str(&self.payload)?,
            message_id: self.message_id,
        })
    }
}

/// Queue store persisted in a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: Pool<Sqlite>,
}

impl SqliteQueueStore {
    /// Open (creating if needed) the queue database and run migrations
    ///
    /// # Errors
    /// Returns `QueueUnavailable` if the file cannot be opened or migrated
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::QueueUnavailable(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running pending migrations
    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, AppError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Queue migration failed: {}", e);
                AppError::QueueUnavailable(e.into())
            })?;

        tracing::info!("Queue database connected and migrated successfully");
        Ok(Self { pool })
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn settle(&self, lease: &Lease, to: QueueState) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE activity_queue
            SET state = ?, lease_id = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE message_id = ? AND state = 'processing' AND lease_id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&lease.message_id)
        .bind(&lease.lease_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    async fn push(&self, message: &QueueMessage) -> Result<String, AppError> {
        let message_id = ulid::Ulid::new().to_string();
        let payload = serde_json::to_string(message)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO activity_queue
                (message_id, state, position, payload, created_at, updated_at)
            VALUES
                (?, 'queued', (SELECT COALESCE(MAX(position), 0) + 1 FROM activity_queue), ?, ?, ?)
            "#,
        )
        .bind(&message_id)
        .bind(payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(message_id)
    }

    async fn pop(&self, visibility: Duration) -> Result<Option<Lease>, AppError> {
        let now = Utc::now();
        let now_millis = now.timestamp_millis();
        let visibility_millis = i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX);
        let lease_id = ulid::Ulid::new().to_string();

        let row = sqlx::query_as::<_, (String, String)>(
            r#"
            UPDATE activity_queue
            SET state = 'processing', lease_id = ?, lease_expires_at = ?, updated_at = ?
            WHERE message_id = (
                SELECT message_id FROM activity_queue
                WHERE state = 'queued'
                   OR (state = 'processing' AND lease_expires_at <= ?)
                ORDER BY position
                LIMIT 1
            )
            RETURNING message_id, payload
            "#,
        )
        .bind(&lease_id)
        .bind(now_millis.saturating_add(visibility_millis))
        .bind(now.to_rfc3339())
        .bind(now_millis)
        .fetch_optional(&self.pool)
        .await?;

        let Some((message_id, payload)) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            message_id,
            lease_id,
            message: serde_json::from_str(&payload)?,
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM activity_queue
            WHERE message_id = ? AND state = 'processing' AND lease_id = ?
            "#,
        )
        .bind(&lease.message_id)
        .bind(&lease.lease_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, lease: &Lease) -> Result<bool, AppError> {
        self.settle(lease, QueueState::Failed).await
    }

    async fn dead_letter(&self, lease: &Lease) -> Result<bool, AppError> {
        self.settle(lease, QueueState::Dead).await
    }

    async fn requeue(
        &self,
        message_id: &str,
        from: QueueState,
        message: &QueueMessage,
    ) -> Result<bool, AppError> {
        let payload = serde_json::to_string(message)?;

        let result = sqlx::query(
            r#"
            UPDATE activity_queue
            SET state = 'queued',
                position = (SELECT COALESCE(MAX(position), 0) + 1 FROM activity_queue),
                payload = ?,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE message_id = ? AND state = ?
            "#,
        )
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .bind(message_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn bury(&self, message_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE activity_queue
            SET state = 'dead', updated_at = ?
            WHERE message_id = ? AND state = 'failed'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, state: QueueState) -> Result<Vec<StoredMessage>, AppError> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT message_id, state, payload
            FROM activity_queue
            WHERE state = ?
            ORDER BY position
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_stored).collect()
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM activity_queue GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match state.parse()? {
                QueueState::Queued => counts.queued = count,
                QueueState::Processing => counts.processing = count,
                QueueState::Failed => counts.failed = count,
                QueueState::Dead => counts.dead = count,
                QueueState::Delivered => {}
            }
        }
        Ok(counts)
    }
}
