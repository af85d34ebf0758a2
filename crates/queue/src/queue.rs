//! Job queue core: enqueue, lookup, stats and cleanup.
//!
//! All queue state lives in the store, so several processes may share a
//! queue. Moving a job between sets is always either a single atomic command
//! (`ZPOPMIN`, `ZREM`, `SET NX`) or one atomic batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bazaar_common::{AppError, AppResult, KeyValueStore, QueueConfig, StoreCommand};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use ulid::Ulid;
use validator::Validate;

use crate::events::QueueEvent;
use crate::handler::JobHandler;
use crate::job::{EnqueuedJob, Job, JobOptions, QueueStats, idempotency_hash};
use crate::retry::RetryConfig;
use crate::worker::WorkerHandle;

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Longest queue name or job type accepted.
const MAX_NAME_LEN: usize = 128;

/// Store key layout.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub(crate) fn job(&self, id: &str) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    pub(crate) fn waiting(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:waiting", self.prefix)
    }

    pub(crate) fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:delayed", self.prefix)
    }

    pub(crate) fn active(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:active", self.prefix)
    }

    pub(crate) fn completed(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:completed", self.prefix)
    }

    pub(crate) fn failed(&self, queue: &str) -> String {
        format!("{}:queue:{queue}:failed", self.prefix)
    }

    pub(crate) fn idempotency(&self, queue: &str, hash: &str) -> String {
        format!("{}:queue:{queue}:idem:{hash}", self.prefix)
    }
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) keys: QueueKeys,
    pub(crate) config: QueueConfig,
    pub(crate) retry: RetryConfig,
    pub(crate) processors: RwLock<HashMap<(String, String), Arc<dyn JobHandler>>>,
    pub(crate) events: broadcast::Sender<QueueEvent>,
    pub(crate) workers: Mutex<HashMap<String, WorkerHandle>>,
}

/// Redis-backed job queue.
///
/// Cheap to clone; clones share processors, workers and the event channel.
#[derive(Clone)]
pub struct JobQueue {
    pub(crate) inner: Arc<Inner>,
}

impl JobQueue {
    /// Create a queue over the given store. Keys are namespaced under `prefix`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: &str, config: QueueConfig) -> Self {
        let retry = RetryConfig::from_queue_config(&config);
        Self::with_retry(store, prefix, config, retry)
    }

    /// Create a queue with an explicit retry policy.
    #[must_use]
    pub fn with_retry(
        store: Arc<dyn KeyValueStore>,
        prefix: &str,
        config: QueueConfig,
        retry: RetryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                keys: QueueKeys::new(prefix),
                config,
                retry,
                processors: RwLock::new(HashMap::new()),
                events,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue settings.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Whether the backing store currently has a live connection.
    #[must_use]
    pub fn store_connected(&self) -> bool {
        self.inner.store.is_connected()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Enqueue a job.
    ///
    /// Identical `(queue, type, payload)` submissions made while the first
    /// one's idempotency marker lives, or while that job is still pending or
    /// running, return the first job's id with `is_new == false` and change
    /// nothing.
    pub async fn add_job<P: Serialize + ?Sized>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &P,
        options: JobOptions,
    ) -> AppResult<EnqueuedJob> {
        validate_name("queue", queue)?;
        validate_name("job type", job_type)?;
        options.validate()?;
        let payload = serde_json::to_value(payload)?;

        let store = &self.inner.store;
        if !store.is_connected() {
            return Err(AppError::StoreUnavailable(
                "cannot enqueue: store is not connected".to_string(),
            ));
        }

        let delay = Duration::from_millis(options.delay.max(0) as u64);
        let (id, marker) = if options.idempotent {
            let hash = idempotency_hash(queue, job_type, &payload);
            let id = format!("{job_type}:{hash}");
            let marker = self.inner.keys.idempotency(queue, &hash);
            let ttl = Duration::from_secs(self.inner.config.idempotency_ttl_secs) + delay;

            if !store.set_nx(&marker, &id, ttl).await? {
                let existing = store.get(&marker).await?.unwrap_or(id);
                debug!(queue, job_type, job_id = %existing, "Duplicate job suppressed");
                return Ok(self.duplicate(queue, job_type, existing));
            }

            // The marker expired but the job it guarded may still be live.
            // Its id is the same, so writing a new record would run it twice.
            match self.is_live(&id).await {
                Ok(false) => {}
                Ok(true) => {
                    store.set(&marker, &id, Some(ttl)).await?;
                    debug!(queue, job_type, job_id = %id, "Job still live, duplicate suppressed");
                    return Ok(self.duplicate(queue, job_type, id));
                }
                Err(e) => {
                    let _ = store.del(&[marker]).await;
                    return Err(e);
                }
            }
            (id, Some(marker))
        } else {
            let id = format!("{job_type}:{}", Ulid::new().to_string().to_lowercase());
            (id, None)
        };

        let job = Job::new(id, queue, job_type, payload, &options, Utc::now());
        let placement = match job.delayed_score() {
            Some(score) => StoreCommand::ZAdd {
                key: self.inner.keys.delayed(queue),
                score,
                member: job.id.clone(),
            },
            None => StoreCommand::ZAdd {
                key: self.inner.keys.waiting(queue),
                score: job.ready_score(),
                member: job.id.clone(),
            },
        };

        let write = self
            .inner
            .store
            .exec(vec![self.save_command(&job)?, placement])
            .await;

        if let Err(e) = write {
            // Release the marker so the caller can retry the submission.
            if let Some(marker) = marker {
                let _ = store.del(&[marker]).await;
            }
            warn!(queue, job_type, error = %e, "Failed to enqueue job");
            return Err(e);
        }

        info!(
            queue,
            job_type,
            job_id = %job.id,
            priority = job.priority,
            delayed = job.delay_until.is_some(),
            "Job enqueued"
        );

        self.emit(QueueEvent::JobAdded {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            queue: queue.to_string(),
            is_new: true,
        });

        Ok(EnqueuedJob {
            id: job.id,
            is_new: true,
        })
    }

    fn duplicate(&self, queue: &str, job_type: &str, id: String) -> EnqueuedJob {
        self.emit(QueueEvent::JobAdded {
            job_id: id.clone(),
            job_type: job_type.to_string(),
            queue: queue.to_string(),
            is_new: false,
        });
        EnqueuedJob { id, is_new: false }
    }

    /// Whether a record exists for `job_id` that has not reached a terminal state.
    /// Unreadable records count as gone.
    async fn is_live(&self, job_id: &str) -> AppResult<bool> {
        match self.load_job(job_id).await {
            Ok(job) => Ok(job.is_some_and(|job| !job.status.is_terminal())),
            Err(AppError::Serialization(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register the handler for a `(queue, type)` pair, replacing any previous one.
    pub async fn register_processor<H>(&self, queue: &str, job_type: &str, handler: H)
    where
        H: JobHandler + 'static,
    {
        let replaced = self
            .inner
            .processors
            .write()
            .await
            .insert((queue.to_string(), job_type.to_string()), Arc::new(handler))
            .is_some();

        if replaced {
            info!(queue, job_type, "Replaced job processor");
        } else {
            info!(queue, job_type, "Registered job processor");
        }
    }

    pub(crate) async fn processor(&self, queue: &str, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .processors
            .read()
            .await
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned()
    }

    /// Look up a job record. Missing, expired or unreadable records read as `None`.
    pub async fn get_job_status(&self, job_id: &str) -> Option<Job> {
        match self.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to read job status");
                None
            }
        }
    }

    pub(crate) async fn load_job(&self, job_id: &str) -> AppResult<Option<Job>> {
        let Some(raw) = self.inner.store.get(&self.inner.keys.job(job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub(crate) fn save_command(&self, job: &Job) -> AppResult<StoreCommand> {
        Ok(StoreCommand::Set {
            key: self.inner.keys.job(&job.id),
            value: serde_json::to_string(job)?,
            ttl: Some(Duration::from_secs(self.inner.config.job_ttl_secs)),
        })
    }

    /// Set sizes for a queue. Zeroed if the store cannot be read.
    pub async fn get_queue_stats(&self, queue: &str) -> QueueStats {
        let keys = &self.inner.keys;
        let result = self
            .inner
            .store
            .exec(vec![
                StoreCommand::ZCard(keys.waiting(queue)),
                StoreCommand::ZCard(keys.active(queue)),
                StoreCommand::LLen(keys.completed(queue)),
                StoreCommand::LLen(keys.failed(queue)),
                StoreCommand::ZCard(keys.delayed(queue)),
            ])
            .await;

        let replies = match result {
            Ok(replies) => replies,
            Err(e) => {
                warn!(queue, error = %e, "Failed to read queue stats");
                return QueueStats::default();
            }
        };

        let count = |i: usize| {
            replies
                .get(i)
                .and_then(bazaar_common::StoreReply::as_int)
                .unwrap_or_default()
                .max(0) as u64
        };

        let mut stats = QueueStats {
            waiting: count(0),
            active: count(1),
            completed: count(2),
            failed: count(3),
            delayed: count(4),
            total: 0,
        };
        stats.total = stats.waiting + stats.active + stats.completed + stats.failed + stats.delayed;
        stats
    }

    /// Empty the completed log. Returns the number of entries removed, 0 on error.
    pub async fn clear_completed_jobs(&self, queue: &str) -> u64 {
        self.clear_log(queue, &self.inner.keys.completed(queue)).await
    }

    /// Empty the failed log. Returns the number of entries removed, 0 on error.
    pub async fn clear_failed_jobs(&self, queue: &str) -> u64 {
        self.clear_log(queue, &self.inner.keys.failed(queue)).await
    }

    async fn clear_log(&self, queue: &str, key: &str) -> u64 {
        let result = self
            .inner
            .store
            .exec(vec![
                StoreCommand::LLen(key.to_string()),
                StoreCommand::Del(vec![key.to_string()]),
            ])
            .await;

        match result {
            Ok(replies) => {
                let removed = replies
                    .first()
                    .and_then(bazaar_common::StoreReply::as_int)
                    .unwrap_or_default()
                    .max(0) as u64;
                info!(queue, key, removed, "Cleared job log");
                removed
            }
            Err(e) => {
                warn!(queue, key, error = %e, "Failed to clear job log");
                0
            }
        }
    }

    /// Most recent completed jobs, newest first.
    pub async fn recent_completed(&self, queue: &str, limit: usize) -> Vec<Job> {
        self.read_log(&self.inner.keys.completed(queue), limit).await
    }

    /// Most recent dead-lettered jobs, newest first.
    pub async fn recent_failed(&self, queue: &str, limit: usize) -> Vec<Job> {
        self.read_log(&self.inner.keys.failed(queue), limit).await
    }

    async fn read_log(&self, key: &str, limit: usize) -> Vec<Job> {
        if limit == 0 {
            return Vec::new();
        }
        match self.inner.store.lrange(key, 0, limit as i64 - 1).await {
            Ok(entries) => entries
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect(),
            Err(e) => {
                warn!(key, error = %e, "Failed to read job log");
                Vec::new()
            }
        }
    }
}

fn validate_name(what: &str, name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "{what} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(AppError::Validation(format!(
            "{what} must not contain whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bazaar_common::MemoryStore;
    use serde_json::json;

    fn queue_with_store() -> (JobQueue, MemoryStore) {
        let store = MemoryStore::new();
        let queue = JobQueue::new(Arc::new(store.clone()), "test", QueueConfig::default());
        (queue, store)
    }

    #[test]
    fn test_keys() {
        let keys = QueueKeys::new("bazaar:");
        assert_eq!(keys.job("email:1"), "bazaar:job:email:1");
        assert_eq!(keys.waiting("q"), "bazaar:queue:q:waiting");
        assert_eq!(keys.idempotency("q", "abc"), "bazaar:queue:q:idem:abc");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("queue", "emails").is_ok());
        assert!(validate_name("queue", "").is_err());
        assert!(validate_name("queue", "a b").is_err());
        assert!(validate_name("queue", &"x".repeat(200)).is_err());
    }

    #[tokio::test]
    async fn test_add_job_persists_record() {
        let (queue, _) = queue_with_store();

        let added = queue
            .add_job("q", "email", &json!({"to": "a@b.com"}), JobOptions::default())
            .await
            .unwrap();

        assert!(added.is_new);
        assert!(added.id.starts_with("email:"));

        let job = queue.get_job_status(&added.id).await.unwrap();
        assert_eq!(job.queue, "q");
        assert_eq!(job.payload["to"], "a@b.com");
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_add_job_twice_returns_same_id() {
        let (queue, _) = queue_with_store();
        let payload = json!({"to": "a@b.com"});

        let first = queue
            .add_job("q", "email", &payload, JobOptions::default())
            .await
            .unwrap();
        let second = queue
            .add_job("q", "email", &payload, JobOptions::default())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(first.is_new);
        assert!(!second.is_new);

        let stats = queue.get_queue_stats("q").await;
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_jobs_are_distinct() {
        let (queue, _) = queue_with_store();
        let payload = json!({"n": 1});
        let options = JobOptions::default().non_idempotent();

        let a = queue.add_job("q", "ping", &payload, options.clone()).await.unwrap();
        let b = queue.add_job("q", "ping", &payload, options).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(queue.get_queue_stats("q").await.waiting, 2);
    }

    #[tokio::test]
    async fn test_delayed_job_goes_to_delayed_set() {
        let (queue, _) = queue_with_store();

        queue
            .add_job("q", "email", &json!({}), JobOptions::default().with_delay_ms(60_000))
            .await
            .unwrap();

        let stats = queue.get_queue_stats("q").await;
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.delayed, 1);
    }

    #[tokio::test]
    async fn test_invalid_options_write_nothing() {
        let (queue, store) = queue_with_store();

        let result = queue
            .add_job("q", "email", &json!({}), JobOptions::default().with_delay_ms(-5))
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(store.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_job_store_unavailable_is_an_error() {
        let (queue, store) = queue_with_store();
        store.set_available(false);

        let result = queue
            .add_job("q", "email", &json!({}), JobOptions::default())
            .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_reads_degrade_when_store_unavailable() {
        let (queue, store) = queue_with_store();
        let added = queue
            .add_job("q", "email", &json!({}), JobOptions::default())
            .await
            .unwrap();

        store.set_available(false);

        assert!(queue.get_job_status(&added.id).await.is_none());
        assert_eq!(queue.get_queue_stats("q").await, QueueStats::default());
        assert_eq!(queue.clear_completed_jobs("q").await, 0);
        assert!(queue.recent_failed("q", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_record_reads_as_missing() {
        let (queue, store) = queue_with_store();
        store.set("test:job:broken", "{not json", None).await.unwrap();

        assert!(queue.get_job_status("broken").await.is_none());
        assert!(queue.get_job_status("absent").await.is_none());
    }

    #[tokio::test]
    async fn test_job_added_events() {
        let (queue, _) = queue_with_store();
        let mut events = queue.subscribe();

        queue
            .add_job("q", "email", &json!({"a": 1}), JobOptions::default())
            .await
            .unwrap();
        queue
            .add_job("q", "email", &json!({"a": 1}), JobOptions::default())
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, QueueEvent::JobAdded { is_new: true, .. }));
        assert!(matches!(second, QueueEvent::JobAdded { is_new: false, .. }));
        assert_eq!(first.job_id(), second.job_id());
    }
}
