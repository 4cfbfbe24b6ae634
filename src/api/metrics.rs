//! Prometheus metrics endpoint
//!
//! Exposes application metrics in Prometheus format. Queue depth gauges are
//! refreshed from the store on every scrape.

use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{QUEUE_DEPTH, REGISTRY};
use crate::queue::QueueState;

/// Metrics endpoint handler
///
/// Returns all metrics in Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.queue.counts().await {
        Ok(counts) => {
            for (queue_state, depth) in [
                (QueueState::Queued, counts.queued),
                (QueueState::Processing, counts.processing),
                (QueueState::Failed, counts.failed),
                (QueueState::Dead, counts.dead),
            ] {
                QUEUE_DEPTH
                    .with_label_values(&[queue_state.as_str()])
                    .set(i64::try_from(depth).unwrap_or(i64::MAX));
            }
        }
        // Still serve the remaining metrics
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth for metrics"),
    }

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the `/metrics` endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
