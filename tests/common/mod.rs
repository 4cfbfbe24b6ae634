//! Common test utilities for E2E tests
//!
//! - `MockRemote`: a remote server publishing actor documents and an inbox
//!   with a scripted response
//! - `TestServer`: a fedcourier instance serving verified inboxes

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use fedcourier::api::InboxHandler;
use fedcourier::error::AppError;
use fedcourier::federation::{
    HttpActorDirectory, LocalActorKey, PublicKeyCache, SignatureVerifier, VerifyPolicy,
    sign_request,
};
use fedcourier::queue::{Activity, ActivityQueue, QueueSettings, SqliteQueueStore};
use fedcourier::{AppState, build_router};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub const ACTOR_KEY_PEM: &str = include_str!("../fixtures/actor_key.pem");
pub const ACTOR_PUBLIC_KEY_PEM: &str = include_str!("../fixtures/actor_key.pub.pem");
pub const OTHER_KEY_PEM: &str = include_str!("../fixtures/other_key.pem");

/// Username the mock remote answers 404 for
pub const UNKNOWN_USER: &str = "ghost";

/// Request captured by the mock inbox
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct MockState {
    base_url: String,
    inbox_status: StatusCode,
    inbox_delay: Duration,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    actor_fetches: Arc<AtomicUsize>,
}

/// Remote server stand-in
pub struct MockRemote {
    pub addr: String,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    actor_fetches: Arc<AtomicUsize>,
}

impl MockRemote {
    /// Start a remote whose inboxes always answer `inbox_status`
    pub async fn start(inbox_status: StatusCode) -> Self {
        Self::start_with_delay(inbox_status, Duration::ZERO).await
    }

    /// Start a remote whose inboxes answer after `inbox_delay`
    pub async fn start_with_delay(inbox_status: StatusCode, inbox_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let received = Arc::new(Mutex::new(Vec::new()));
        let actor_fetches = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            base_url: addr.clone(),
            inbox_status,
            inbox_delay,
            received: received.clone(),
            actor_fetches: actor_fetches.clone(),
        };

        let app = axum::Router::new()
            .route("/users/:username", get(actor_document))
            .route("/users/:username/inbox", post(record_inbox))
            .route("/inbox", post(record_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            received,
            actor_fetches,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_id(&self, username: &str) -> String {
        self.url(&format!("/users/{}", username))
    }

    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.actor_id(username))
    }

    pub async fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().await.clone()
    }

    pub fn actor_fetches(&self) -> usize {
        self.actor_fetches.load(Ordering::SeqCst)
    }
}

async fn actor_document(State(state): State<MockState>, Path(username): Path<String>) -> Response {
    state.actor_fetches.fetch_add(1, Ordering::SeqCst);

    if username == UNKNOWN_USER {
        return StatusCode::NOT_FOUND.into_response();
    }

    let actor_id = format!("{}/users/{}", state.base_url, username);
    Json(serde_json::json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor_id,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{}/inbox", actor_id),
        "publicKey": {
            "id": format!("{}#main-key", actor_id),
            "owner": actor_id,
            "publicKeyPem": ACTOR_PUBLIC_KEY_PEM,
        }
    }))
    .into_response()
}

async fn record_inbox(
    State(state): State<MockState>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().await.push(ReceivedRequest {
        path: uri.path().to_string(),
        headers,
        body,
    });
    if !state.inbox_delay.is_zero() {
        tokio::time::sleep(state.inbox_delay).await;
    }
    state.inbox_status
}

/// Inbox handler that keeps every activity it is given
#[derive(Default, Clone)]
pub struct RecordingInboxHandler {
    pub activities: Arc<Mutex<Vec<(Option<String>, Activity)>>>,
}

#[async_trait::async_trait]
impl InboxHandler for RecordingInboxHandler {
    async fn handle(&self, username: Option<&str>, activity: Activity) -> Result<(), AppError> {
        self.activities
            .lock()
            .await
            .push((username.map(str::to_string), activity));
        Ok(())
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub handler: RecordingInboxHandler,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    ///
    /// Keys are fetched over HTTP with the private-address guard off so the
    /// mock remote on loopback can serve them.
    pub async fn new() -> Self {
        fedcourier::metrics::init_metrics();

        // Create temporary directory for test queue
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteQueueStore::connect(&temp_dir.path().join("queue.db"))
            .await
            .unwrap();
        let queue = ActivityQueue::new(Arc::new(store), QueueSettings::default());

        let directory =
            HttpActorDirectory::new(Duration::from_secs(5), "fedcourier-test", true).unwrap();
        let key_cache = PublicKeyCache::new(Arc::new(directory), Duration::from_secs(3600), 100);
        let verifier = SignatureVerifier::new(Arc::new(key_cache), VerifyPolicy::default());

        let handler = RecordingInboxHandler::default();
        let state = AppState::new(queue, verifier, Arc::new(handler.clone()));

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        // Spawn server in background
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handler,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub async fn received(&self) -> Vec<(Option<String>, Activity)> {
        self.handler.activities.lock().await.clone()
    }
}

pub fn actor_key(key_id: &str) -> LocalActorKey {
    LocalActorKey::from_pem(key_id, ACTOR_KEY_PEM).unwrap()
}

pub fn create_activity(n: u32, actor: &str) -> Activity {
    Activity::new(
        format!("{}/activities/{}", actor, n),
        "Create",
        actor,
        serde_json::json!({
            "id": format!("{}/notes/{}", actor, n),
            "type": "Note",
            "attributedTo": actor,
            "content": format!("note {}", n),
        }),
    )
    .with_extension(
        "@context",
        serde_json::json!("https://www.w3.org/ns/activitystreams"),
    )
}

/// POST `body` to `url` with signature headers from `key`
pub async fn signed_post(
    client: &reqwest::Client,
    key: &LocalActorKey,
    url: &str,
    body: Vec<u8>,
) -> reqwest::Response {
    let parsed = url::Url::parse(url).unwrap();
    let signed = sign_request(key, "POST", &parsed, Some(&body)).unwrap();

    signed
        .apply(client.post(url))
        .header("Content-Type", "application/activity+json")
        .body(body)
        .send()
        .await
        .unwrap()
}
