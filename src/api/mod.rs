//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inboxes (federation)
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;

pub use activitypub::{InboxHandler, LoggingInboxHandler, activitypub_router};
pub use metrics::metrics_router;
