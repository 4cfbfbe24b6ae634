//! Durable outbound activity queue
//!
//! - Typed activity payloads and their queue envelope
//! - Queue state machine (enqueue, lease, settle, retry sweep, replay)
//! - Store interface with SQLite and in-memory implementations

mod activity;
mod activity_queue;
mod memory;
mod sqlite;
mod store;

pub use activity::{Activity, QueueMessage, builder, resolve_inbox_url};
pub use activity_queue::{
    ActivityQueue, DEFAULT_MAX_RETRIES, DeliveryOutcome, ProcessedMessage, QueueSettings,
    RetrySweep,
};
pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;
pub use store::{Lease, QueueCounts, QueueState, QueueStore, StoredMessage};
