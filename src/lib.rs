//! fedcourier - HTTP Signatures and durable outbound delivery for ActivityPub
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Signed inbox endpoints                                   │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Signature composer / verifier                            │
//! │  - Key resolution (single-flight cache)                     │
//! │  - Delivery workers, retry sweeper                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Queue Layer                            │
//! │  - Activity queue state machine                             │
//! │  - SQLite (sqlx) / in-memory stores                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub inboxes and metrics
//! - `federation`: HTTP Signatures, key resolution, delivery
//! - `queue`: Durable outbound activity queue
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    ActivityDelivery, DeliveryWorker, HttpActorDirectory, LocalActorKey, PublicKeyCache,
    RetrySweeper, SignatureVerifier,
};
use queue::{ActivityQueue, SqliteQueueStore};

/// Application state shared across all handlers
///
/// This struct is cloned for each request.
#[derive(Clone)]
pub struct AppState {
    /// Outbound queue (also read for metrics)
    pub queue: ActivityQueue,

    /// Inbound signature gate
    pub verifier: SignatureVerifier,

    /// Receives verified inbound activities
    pub inbox_handler: Arc<dyn api::InboxHandler>,
}

impl AppState {
    pub fn new(
        queue: ActivityQueue,
        verifier: SignatureVerifier,
        inbox_handler: Arc<dyn api::InboxHandler>,
    ) -> Self {
        Self {
            queue,
            verifier,
            inbox_handler,
        }
    }
}

/// Everything a running courier process owns
pub struct Courier {
    pub config: Arc<config::AppConfig>,
    pub state: AppState,
    pub actor_key: Arc<LocalActorKey>,
    pub key_cache: PublicKeyCache,
}

impl Courier {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Load the local actor's signing key
    /// 2. Open the SQLite queue
    /// 3. Build the key cache and verifier
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Signing key; a malformed key stops startup
        let actor_key = Arc::new(LocalActorKey::from_file(
            config.actor.key_id.clone(),
            &config.actor.private_key_path,
        )?);
        tracing::info!(key_id = %actor_key.key_id(), "Actor key loaded");

        // 2. Durable queue
        let store = SqliteQueueStore::connect(&config.queue.database_path).await?;
        let queue = ActivityQueue::new(Arc::new(store), config.queue.settings());
        tracing::info!("Activity queue opened");

        // 3. Key resolution and verification
        let directory = HttpActorDirectory::new(
            Duration::from_secs(config.key_cache.fetch_timeout_seconds),
            &config.delivery.user_agent,
            config.key_cache.allow_private_hosts,
        )?;
        let key_cache = PublicKeyCache::new(
            Arc::new(directory),
            Duration::from_secs(config.key_cache.ttl_seconds),
            config.key_cache.max_entries,
        );
        let verifier = SignatureVerifier::new(Arc::new(key_cache.clone()), config.verify.policy());

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            state: AppState::new(queue, verifier, Arc::new(api::LoggingInboxHandler)),
            config: Arc::new(config),
            actor_key,
            key_cache,
        })
    }

    /// One worker per configured `delivery.workers`
    pub fn delivery_workers(&self) -> Result<Vec<DeliveryWorker>, error::AppError> {
        let delivery = ActivityDelivery::new(
            self.actor_key.clone(),
            Duration::from_secs(self.config.delivery.timeout_seconds),
            &self.config.delivery.user_agent,
            self.config.delivery.accept_any_2xx,
        )?;
        let idle_poll = Duration::from_millis(self.config.delivery.idle_poll_millis);

        Ok((0..self.config.delivery.workers)
            .map(|id| {
                DeliveryWorker::new(id, self.state.queue.clone(), delivery.clone(), idle_poll)
            })
            .collect())
    }

    pub fn retry_sweeper(&self) -> RetrySweeper {
        RetrySweeper::new(
            self.state.queue.clone(),
            Duration::from_secs(self.config.retry.interval_seconds),
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
