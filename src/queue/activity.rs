//! Activity payloads and their queue envelope
//!
//! Activities are typed on the fields delivery depends on (`id`, `type`,
//! `actor`, `object`); every other ActivityStreams property, `target`
//! included, is carried through untouched in `extensions`. The inbox a
//! message is routed to lives on the envelope, never in the document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// An ActivityPub activity, outbound or received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity URI, assigned by the producer and never changed afterwards
    pub id: String,
    /// Activity type (Create, Follow, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Actor URI
    pub actor: String,
    /// Activity object (URI or embedded object)
    pub object: Value,
    /// Remaining ActivityStreams properties (`@context`, `to`, `target`, ...)
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Activity {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        actor: impl Into<String>,
        object: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            actor: actor.into(),
            object,
            extensions: Map::new(),
        }
    }

    /// Attach an extra ActivityStreams property
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Check the fields delivery relies on
    pub fn validate(&self) -> Result<(), AppError> {
        for (name, value) in [("id", &self.id), ("type", &self.kind), ("actor", &self.actor)] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "Activity is missing required field: {}",
                    name
                )));
            }
        }

        if self.object.is_null() {
            return Err(AppError::Validation(
                "Activity is missing required field: object".to_string(),
            ));
        }

        Ok(())
    }
}

/// Resolve a delivery target to the inbox that receives the POST.
///
/// Targets whose path already ends in `/inbox` are used verbatim; anything
/// else is treated as a base URL and gets `/inbox` appended.
pub fn resolve_inbox_url(target: &str) -> Result<url::Url, AppError> {
    let mut parsed = url::Url::parse(target.trim())
        .map_err(|e| AppError::Validation(format!("Invalid target URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported target URL scheme: {}",
                scheme
            )));
        }
    }

    if parsed.host_str().is_none() {
        return Err(AppError::Validation(
            "Missing host in target URL".to_string(),
        ));
    }

    if !parsed.path().ends_with("/inbox") {
        let path = format!("{}/inbox", parsed.path().trim_end_matches('/'));
        parsed.set_path(&path);
    }
    parsed.set_fragment(None);

    Ok(parsed)
}

/// Durable queue envelope
///
/// Serializes to the flat persisted form
/// `{id, type, actor, object, ..., delivery_target, queued_at, retry_count, last_retry?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(flatten)]
    pub activity: Activity,
    /// Destination inbox URL, or a base URL that `/inbox` is appended to
    pub delivery_target: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Wrap a freshly produced activity bound for `delivery_target`
    pub fn new(activity: Activity, delivery_target: impl Into<String>) -> Self {
        Self {
            activity,
            delivery_target: delivery_target.into(),
            queued_at: Utc::now(),
            retry_count: 0,
            last_retry: None,
        }
    }

    /// Copy of this message prepared for another delivery attempt
    pub fn retried(&self, at: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            last_retry: Some(at),
            ..self.clone()
        }
    }

    /// Destination inbox for this message
    pub fn inbox_url(&self) -> Result<url::Url, AppError> {
        resolve_inbox_url(&self.delivery_target)
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

/// Build ActivityPub activity payloads for the queue
pub mod builder {
    use serde_json::Value;

    use super::Activity;

    const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a public Note object
    pub fn note(id: &str, attributed_to: &str, content: &str, published: &str) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": [PUBLIC],
            "cc": [format!("{}/followers", attributed_to)]
        })
    }

    /// Wrap a Note in a Create activity addressed to Public and followers
    pub fn create_note(id: &str, actor: &str, note: Value) -> Activity {
        Activity::new(id, "Create", actor, note)
            .with_extension("@context", Value::from(CONTEXT))
            .with_extension("to", serde_json::json!([PUBLIC]))
            .with_extension("cc", serde_json::json!([format!("{}/followers", actor)]))
            .with_extension(
                "published",
                Value::from(chrono::Utc::now().to_rfc3339()),
            )
    }

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Activity {
        Activity::new(id, "Follow", actor, Value::from(object))
            .with_extension("@context", Value::from(CONTEXT))
    }
}
