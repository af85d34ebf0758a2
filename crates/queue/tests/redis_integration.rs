//! Redis integration tests.
//!
//! These tests require a running Redis instance.
//! Run with: `cargo test --test redis_integration -- --ignored`
//!
//! Set `REDIS_URL` environment variable to point to your Redis instance.
//! Default: <redis://localhost:6379>

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bazaar_common::{QueueConfig, RedisStore};
use bazaar_queue::{HandlerError, Job, JobOptions, JobQueue, JobStatus};
use serde_json::json;
use ulid::Ulid;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Fresh prefix per test so runs never see each other's keys.
fn unique_prefix() -> String {
    format!("bazaar-test-{}", Ulid::new().to_string().to_lowercase())
}

async fn redis_queue() -> JobQueue {
    let store = RedisStore::connect(&get_redis_url())
        .await
        .expect("Failed to connect to Redis");
    let config = QueueConfig {
        concurrency: 2,
        backoff_delay_ms: 20,
        poll_interval_ms: 10,
        ..QueueConfig::default()
    };
    JobQueue::new(Arc::new(store), &unique_prefix(), config)
}

/// Identical submissions against Redis share one job.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_idempotent_enqueue() {
    let queue = redis_queue().await;
    let payload = json!({"to": "user@example.com"});

    let first = queue
        .add_job("emails", "email", &payload, JobOptions::default())
        .await
        .unwrap();
    let second = queue
        .add_job("emails", "email", &payload, JobOptions::default())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(queue.get_queue_stats("emails").await.waiting, 1);
}

/// A job runs to completion through the Redis-backed worker loop.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_process_job() {
    let queue = redis_queue().await;
    queue
        .register_processor("emails", "email", |_job: Job| async { Ok::<(), HandlerError>(()) })
        .await;

    let added = queue
        .add_job("emails", "email", &json!({"n": 1}), JobOptions::default())
        .await
        .unwrap();

    queue.start_processing("emails").await;

    let mut status = None;
    for _ in 0..200 {
        status = queue.get_job_status(&added.id).await.map(|job| job.status);
        if status == Some(JobStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.stop_processing().await;

    assert_eq!(status, Some(JobStatus::Completed));
    assert_eq!(queue.clear_completed_jobs("emails").await, 1);
}
