//! E2E tests for outbound delivery, retry sweeps, and dead-lettering

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{MockRemote, TestServer, actor_key, create_activity};
use fedcourier::federation::{
    ActivityDelivery, DEFAULT_USER_AGENT, DeliveryWorker, RetrySweeper, generate_digest,
    parse_signature_header,
};
use fedcourier::queue::{
    ActivityQueue, DeliveryOutcome, QueueSettings, QueueState, RetrySweep, SqliteQueueStore,
};
use tempfile::TempDir;

const LOCAL_ACTOR: &str = "https://local.example/users/beebo";

async fn sqlite_queue() -> (ActivityQueue, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteQueueStore::connect(&temp_dir.path().join("queue.db"))
        .await
        .unwrap();
    (
        ActivityQueue::new(Arc::new(store), QueueSettings::default()),
        temp_dir,
    )
}

fn worker(queue: &ActivityQueue, key_id: &str, timeout: Duration, accept_any_2xx: bool) -> DeliveryWorker {
    let delivery = ActivityDelivery::new(
        Arc::new(actor_key(key_id)),
        timeout,
        DEFAULT_USER_AGENT,
        accept_any_2xx,
    )
    .unwrap();
    DeliveryWorker::new(0, queue.clone(), delivery, Duration::from_millis(10))
}

#[tokio::test]
async fn test_failing_inbox_dead_letters_after_three_sweeps() {
    let remote = MockRemote::start(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (queue, _temp_dir) = sqlite_queue().await;
    let worker = worker(
        &queue,
        &format!("{}#main-key", LOCAL_ACTOR),
        Duration::from_secs(5),
        false,
    );
    let sweeper = RetrySweeper::new(queue.clone(), Duration::from_secs(300));

    for n in 0..5 {
        queue
            .enqueue(create_activity(n, LOCAL_ACTOR), &remote.actor_id("alice"))
            .await
            .unwrap();
    }

    // One delivery pass: everything fails without counting a retry
    let processed = worker.drain().await.unwrap();
    assert_eq!(processed.len(), 5);
    assert!(
        processed
            .iter()
            .all(|p| p.outcome == DeliveryOutcome::Failed && p.retry_count == 0)
    );
    let failed = queue.list(QueueState::Failed).await.unwrap();
    assert_eq!(failed.len(), 5);
    assert!(failed.iter().all(|m| m.message.retry_count == 0));

    // Three sweeps, each followed by another failing pass
    for sweep_number in 1..=3u32 {
        let sweep = sweeper.sweep_once().await.unwrap();
        assert_eq!(sweep.retried, 5, "sweep {sweep_number}");

        let queued = queue.list(QueueState::Queued).await.unwrap();
        assert!(queued.iter().all(|m| m.message.retry_count == sweep_number));

        worker.drain().await.unwrap();
    }

    let dead = queue.list(QueueState::Dead).await.unwrap();
    assert_eq!(dead.len(), 5);
    assert!(dead.iter().all(|m| m.message.retry_count == 3));

    // A fourth sweep leaves the dead letters alone
    assert_eq!(sweeper.sweep_once().await.unwrap(), RetrySweep::default());
    let counts = queue.counts().await.unwrap();
    assert_eq!(
        (counts.queued, counts.processing, counts.failed, counts.dead),
        (0, 0, 0, 5)
    );
    assert!(worker.run_once().await.unwrap().is_none());

    // 5 activities x 4 attempts
    assert_eq!(remote.received().await.len(), 20);
}

#[tokio::test]
async fn test_delivery_request_shape() {
    let remote = MockRemote::start(StatusCode::OK).await;
    let (queue, _temp_dir) = sqlite_queue().await;
    let key_id = format!("{}#main-key", LOCAL_ACTOR);
    let worker = worker(&queue, &key_id, Duration::from_secs(5), false);

    let activity = create_activity(1, LOCAL_ACTOR);
    queue
        .enqueue(activity.clone(), &remote.actor_id("alice"))
        .await
        .unwrap();

    let processed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::Delivered);
    assert_eq!(queue.counts().await.unwrap().queued, 0);

    let received = remote.received().await;
    assert_eq!(received.len(), 1);
    let request = &received[0];

    // Base URL target gets /inbox appended
    assert_eq!(request.path, "/users/alice/inbox");
    assert_eq!(
        request.headers["content-type"],
        "application/activity+json"
    );
    assert_eq!(request.headers["user-agent"], DEFAULT_USER_AGENT);
    assert!(request.headers.contains_key("date"));
    assert_eq!(
        request.headers["digest"].to_str().unwrap(),
        generate_digest(&request.body)
    );

    let signature =
        parse_signature_header(request.headers["signature"].to_str().unwrap()).unwrap();
    assert_eq!(signature.key_id, key_id);
    assert_eq!(signature.algorithm, "rsa-sha256");
    assert_eq!(
        signature.headers,
        vec!["(request-target)", "host", "date", "digest"]
    );

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["id"], activity.id.as_str());
    assert_eq!(body["type"], "Create");
    assert_eq!(body["@context"], "https://www.w3.org/ns/activitystreams");
    assert!(body.get("delivery_target").is_none());
}

#[tokio::test]
async fn test_accepted_status_is_a_failure_unless_any_2xx_is_allowed() {
    let remote = MockRemote::start(StatusCode::ACCEPTED).await;
    let (queue, _temp_dir) = sqlite_queue().await;
    let key_id = format!("{}#main-key", LOCAL_ACTOR);

    queue
        .enqueue(create_activity(1, LOCAL_ACTOR), &remote.url("/inbox"))
        .await
        .unwrap();
    let strict = worker(&queue, &key_id, Duration::from_secs(5), false);
    let processed = strict.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::Failed);

    queue
        .enqueue(create_activity(2, LOCAL_ACTOR), &remote.url("/inbox"))
        .await
        .unwrap();
    let lenient = worker(&queue, &key_id, Duration::from_secs(5), true);
    let processed = lenient.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::Delivered);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let remote =
        MockRemote::start_with_delay(StatusCode::OK, Duration::from_millis(1500)).await;
    let (queue, _temp_dir) = sqlite_queue().await;
    let worker = worker(
        &queue,
        &format!("{}#main-key", LOCAL_ACTOR),
        Duration::from_millis(200),
        false,
    );

    queue
        .enqueue(create_activity(1, LOCAL_ACTOR), &remote.actor_id("alice"))
        .await
        .unwrap();

    let processed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::Failed);
    assert_eq!(queue.list(QueueState::Failed).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replayed_dead_letter_gets_a_fresh_retry_budget() {
    let remote = MockRemote::start(StatusCode::SERVICE_UNAVAILABLE).await;
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteQueueStore::connect(&temp_dir.path().join("queue.db"))
        .await
        .unwrap();
    let queue = ActivityQueue::new(
        Arc::new(store),
        QueueSettings {
            max_retries: 1,
            ..QueueSettings::default()
        },
    );
    let worker = worker(
        &queue,
        &format!("{}#main-key", LOCAL_ACTOR),
        Duration::from_secs(5),
        false,
    );

    queue
        .enqueue(create_activity(1, LOCAL_ACTOR), &remote.actor_id("alice"))
        .await
        .unwrap();
    worker.drain().await.unwrap();
    queue.retry_failed_activities().await.unwrap();
    let processed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::DeadLettered);

    let dead = queue.dead().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(queue.replay_dead(&dead[0].message_id).await.unwrap());

    // Back to a first attempt: a failure parks it as FAILED, not DEAD
    let processed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed.retry_count, 0);
    assert_eq!(processed.outcome, DeliveryOutcome::Failed);
    assert_eq!(remote.received().await.len(), 3);
}

#[tokio::test]
async fn test_signed_delivery_is_accepted_by_verifying_inbox() {
    // The remote publishes the sending actor; the fedcourier server receives
    let directory = MockRemote::start(StatusCode::OK).await;
    let receiver = TestServer::new().await;
    let (queue, _temp_dir) = sqlite_queue().await;

    let sender = directory.actor_id("beebo");
    let worker = worker(
        &queue,
        &directory.key_id("beebo"),
        Duration::from_secs(5),
        true,
    );

    queue
        .enqueue(create_activity(1, &sender), &receiver.url("/users/alice/inbox"))
        .await
        .unwrap();

    let processed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed.outcome, DeliveryOutcome::Delivered);

    let received = receiver.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.as_deref(), Some("alice"));
    assert_eq!(received[0].1.actor, sender);
    assert_eq!(directory.actor_fetches(), 1);
}
