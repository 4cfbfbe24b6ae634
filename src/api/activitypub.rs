//! ActivityPub inbox endpoints
//!
//! - POST /users/:username/inbox - Personal inbox
//! - POST /inbox - Shared inbox
//!
//! Both gate on HTTP Signature verification before anything reaches the
//! inbox handler.

use axum::body::Bytes;
use axum::extract::OriginalUri;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::{Path, State},
    routing::post,
};
use http::HeaderMap;

use crate::AppState;
use crate::error::AppError;
use crate::federation::key_id_matches_actor;
use crate::metrics::INBOX_ACTIVITIES_RECEIVED;
use crate::queue::Activity;

/// Receives activities that passed signature verification
#[async_trait::async_trait]
pub trait InboxHandler: Send + Sync {
    /// `username` is `None` for the shared inbox
    async fn handle(&self, username: Option<&str>, activity: Activity) -> Result<(), AppError>;
}

/// Inbox handler that only records what arrived
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInboxHandler;

#[async_trait::async_trait]
impl InboxHandler for LoggingInboxHandler {
    async fn handle(&self, username: Option<&str>, activity: Activity) -> Result<(), AppError> {
        tracing::info!(
            activity_id = %activity.id,
            activity_type = %activity.kind,
            actor = %activity.actor,
            inbox = username.unwrap_or("shared"),
            "Received activity"
        );
        Ok(())
    }
}

/// Create ActivityPub router
///
/// Routes:
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// POST /users/:username/inbox
///
/// # Steps
/// 1. Verify HTTP Signature
/// 2. Parse activity
/// 3. Hand off to the inbox handler
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let activity = verified_activity(&state, &uri, &headers, &body).await?;
    state.inbox_handler.handle(Some(&username), activity).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /inbox
///
/// Shared inbox for all users on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let activity = verified_activity(&state, &uri, &headers, &body).await?;
    state.inbox_handler.handle(None, activity).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn verified_activity(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Activity, AppError> {
    // Reject unsigned requests immediately
    if !headers.contains_key("signature") {
        tracing::debug!(path = %uri.path(), "Rejected unsigned inbox request");
        return Err(AppError::Unauthorized);
    }

    // The request-target must be the path the sender signed, query included
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let signature = state
        .verifier
        .check("POST", path, headers, body)
        .await
        .map_err(|_| AppError::Unauthorized)?;

    let activity: Activity = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid activity: {}", e)))?;

    // A key may only speak for its own actor
    if !key_id_matches_actor(&signature.key_id, &activity.actor) {
        tracing::info!(
            key_id = %signature.key_id,
            actor = %activity.actor,
            "Rejected activity signed by a different actor"
        );
        return Err(AppError::Unauthorized);
    }

    INBOX_ACTIVITIES_RECEIVED
        .with_label_values(&[activity.kind.as_str()])
        .inc();

    Ok(activity)
}
