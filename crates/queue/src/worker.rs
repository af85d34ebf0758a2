//! Polling worker loop.
//!
//! One loop runs per processed queue name. Each tick it promotes due delayed
//! jobs, then claims ready jobs while concurrency permits are free, then
//! sleeps for the poll interval or until shutdown is requested.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bazaar_common::{AppError, AppResult, StoreCommand};
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::events::QueueEvent;
use crate::job::{Job, JobStatus};
use crate::queue::JobQueue;

/// Delayed or stalled jobs handled per tick.
const PROMOTE_BATCH: usize = 100;

/// Backoff bounds for rewriting a job outcome the store rejected.
const OUTCOME_RETRY_MIN: Duration = Duration::from_millis(50);
const OUTCOME_RETRY_MAX: Duration = Duration::from_secs(5);

const STALLED_ERROR: &str = "job stalled: worker stopped before recording its outcome";

pub(crate) struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JobQueue {
    /// Start the worker loop for `queue`. Does nothing if it is already running.
    pub async fn start_processing(&self, queue: &str) {
        let mut workers = self.inner.workers.lock().await;
        if workers.contains_key(queue) {
            info!(queue, "Queue is already being processed");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().run_worker(queue.to_string(), shutdown_rx));
        workers.insert(queue.to_string(), WorkerHandle { shutdown, task });

        info!(
            queue,
            concurrency = self.inner.config.concurrency,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "Started processing queue"
        );
    }

    /// Stop every worker loop and wait for in-flight jobs to finish.
    pub async fn stop_processing(&self) {
        let workers: Vec<(String, WorkerHandle)> =
            self.inner.workers.lock().await.drain().collect();

        for (_, worker) in &workers {
            let _ = worker.shutdown.send(true);
        }

        for (queue, worker) in workers {
            if let Err(e) = worker.task.await {
                error!(queue = %queue, error = %e, "Worker task ended abnormally");
            } else {
                info!(queue = %queue, "Stopped processing queue");
            }
        }
    }

    /// Whether a worker loop is running for `queue`.
    pub async fn is_processing(&self, queue: &str) -> bool {
        self.inner.workers.lock().await.contains_key(queue)
    }

    async fn run_worker(self, queue: String, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));
        let poll_interval = self.inner.config.poll_interval();
        let mut running = JoinSet::new();

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            if self.inner.store.is_connected() {
                if let Err(e) = self.recover_stalled(&queue).await {
                    warn!(queue = %queue, error = %e, "Failed to recover stalled jobs");
                }
                if let Err(e) = self.promote_delayed(&queue).await {
                    warn!(queue = %queue, error = %e, "Failed to promote delayed jobs");
                }
                self.dispatch(&queue, &semaphore, &shutdown, &mut running).await;
            } else {
                debug!(queue = %queue, "Store disconnected, skipping tick");
            }

            while let Some(result) = running.try_join_next() {
                if let Err(e) = result {
                    error!(queue = %queue, error = %e, "Job task ended abnormally");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let in_flight = running.len();
        if in_flight > 0 {
            info!(queue = %queue, in_flight, "Waiting for in-flight jobs");
        }
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                error!(queue = %queue, error = %e, "Job task ended abnormally");
            }
        }
    }

    async fn dispatch(
        &self,
        queue: &str,
        semaphore: &Arc<Semaphore>,
        shutdown: &watch::Receiver<bool>,
        running: &mut JoinSet<()>,
    ) {
        loop {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };

            match self.claim_next(queue).await {
                Ok(Some(job)) => {
                    let this = self.clone();
                    let shutdown = shutdown.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        this.run_job(job, shutdown).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(queue, error = %e, "Failed to claim job");
                    break;
                }
            }
        }
    }

    /// Move delayed jobs whose time has come into the waiting set.
    async fn promote_delayed(&self, queue: &str) -> AppResult<usize> {
        let store = &self.inner.store;
        let delayed = self.inner.keys.delayed(queue);
        let now = Utc::now().timestamp_millis() as f64;

        let due = store
            .zrangebyscore(&delayed, f64::NEG_INFINITY, now, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for id in due {
            // Whoever removes the member owns the promotion.
            if store.zrem(&delayed, &id).await? == 0 {
                continue;
            }

            match self.promote_one(queue, &id).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(queue, job_id = %id, error = %e, "Failed to promote job");
                    if let Err(e) = store.zadd(&delayed, now, &id).await {
                        error!(queue, job_id = %id, error = %e, "Lost delayed job");
                    }
                }
            }
        }

        if promoted > 0 {
            debug!(queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn promote_one(&self, queue: &str, id: &str) -> AppResult<bool> {
        let mut job = match self.load_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(queue, job_id = %id, "Dropping delayed job without a record");
                return Ok(false);
            }
            Err(AppError::Serialization(e)) => {
                warn!(queue, job_id = %id, error = %e, "Dropping unreadable delayed job");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        job.status = JobStatus::Pending;
        let commands = vec![
            self.save_command(&job)?,
            StoreCommand::ZAdd {
                key: self.inner.keys.waiting(queue),
                score: job.ready_score(),
                member: job.id.clone(),
            },
        ];
        self.inner.store.exec(commands).await?;
        Ok(true)
    }

    /// Fail jobs left in the active set well past the job timeout.
    ///
    /// Such a job was claimed by a worker that stopped before it could record
    /// the outcome. It goes through the normal failure path, so it is retried
    /// while attempts remain.
    async fn recover_stalled(&self, queue: &str) -> AppResult<usize> {
        let store = &self.inner.store;
        let active = self.inner.keys.active(queue);
        let cutoff = (Utc::now().timestamp_millis()
            - self.inner.config.stalled_after().as_millis() as i64) as f64;

        let stalled = store
            .zrangebyscore(&active, f64::NEG_INFINITY, cutoff, PROMOTE_BATCH)
            .await?;

        let mut recovered = 0;
        for id in stalled {
            if store.zrem(&active, &id).await? == 0 {
                continue;
            }

            let job = match self.load_job(&id).await {
                Ok(Some(job)) if job.status == JobStatus::Active => job,
                Ok(_) | Err(AppError::Serialization(_)) => continue,
                Err(e) => {
                    let _ = store.zadd(&active, cutoff, &id).await;
                    return Err(e);
                }
            };

            warn!(queue, job_id = %id, attempts = job.attempts, "Recovering stalled job");
            if let Err(e) = self.fail(job, STALLED_ERROR.to_string(), 0).await {
                let _ = store.zadd(&active, cutoff, &id).await;
                return Err(e);
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Pop the highest-priority ready job and mark it active.
    async fn claim_next(&self, queue: &str) -> AppResult<Option<Job>> {
        let store = &self.inner.store;
        let waiting = self.inner.keys.waiting(queue);

        loop {
            let Some((id, score)) = store.zpopmin(&waiting).await? else {
                return Ok(None);
            };

            let mut job = match self.load_job(&id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(queue, job_id = %id, "Skipping ready job without a record");
                    continue;
                }
                Err(AppError::Serialization(e)) => {
                    warn!(queue, job_id = %id, error = %e, "Skipping unreadable job");
                    continue;
                }
                Err(e) => {
                    let _ = store.zadd(&waiting, score, &id).await;
                    return Err(e);
                }
            };

            if job.status == JobStatus::Active {
                warn!(queue, job_id = %id, "Skipping ready entry for a job that is already running");
                continue;
            }

            let now = Utc::now();
            job.attempts += 1;
            job.status = JobStatus::Active;
            job.last_attempt_at = Some(now);

            let commands = vec![
                self.save_command(&job)?,
                StoreCommand::ZAdd {
                    key: self.inner.keys.active(queue),
                    score: now.timestamp_millis() as f64,
                    member: job.id.clone(),
                },
            ];
            if let Err(e) = store.exec(commands).await {
                let _ = store.zadd(&waiting, score, &id).await;
                return Err(e);
            }

            debug!(queue, job_id = %job.id, attempt = job.attempts, "Job started");
            self.emit(QueueEvent::JobStarted {
                job_id: job.id.clone(),
                job_type: job.job_type.clone(),
                queue: queue.to_string(),
                attempt: job.attempts,
            });

            return Ok(Some(job));
        }
    }

    /// Run a claimed job and record its outcome.
    ///
    /// A rejected outcome write is retried until the store accepts it. After
    /// shutdown is requested one more write is attempted; if that fails too
    /// the job stays active until stall recovery picks it up.
    async fn run_job(&self, job: Job, mut shutdown: watch::Receiver<bool>) {
        let started = Instant::now();
        let result = self.execute(&job).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut backoff = OUTCOME_RETRY_MIN;
        let mut stopping = false;
        loop {
            let outcome = match &result {
                Ok(()) => self.complete(job.clone(), duration_ms).await,
                Err(message) => self.fail(job.clone(), message.clone(), duration_ms).await,
            };
            let Err(e) = outcome else {
                return;
            };

            let stop_requested = *shutdown.borrow();
            if stopping || stop_requested || matches!(e, AppError::Serialization(_)) {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    error = %e,
                    "Failed to record job outcome, leaving job for stall recovery"
                );
                return;
            }

            warn!(
                queue = %job.queue,
                job_id = %job.id,
                error = %e,
                retry_in_ms = backoff.as_millis() as u64,
                "Failed to record job outcome, retrying"
            );
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => stopping = true,
            }
            backoff = (backoff * 2).min(OUTCOME_RETRY_MAX);
        }
    }

    /// Run the handler under the job timeout. Panics count as failures.
    async fn execute(&self, job: &Job) -> Result<(), String> {
        let Some(handler) = self.processor(&job.queue, &job.job_type).await else {
            return Err(format!(
                "no processor registered for job type '{}' on queue '{}'",
                job.job_type, job.queue
            ));
        };

        let timeout = self.inner.config.job_timeout();
        let run = AssertUnwindSafe(handler.handle(job.clone())).catch_unwind();

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(panic)) => Err(format!("handler panicked: {}", panic_message(&*panic))),
            Err(_) => Err(format!("job timed out after {}ms", timeout.as_millis())),
        }
    }

    async fn complete(&self, mut job: Job, duration_ms: u64) -> AppResult<()> {
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        job.last_error = None;

        let keys = &self.inner.keys;
        let mut commands = vec![
            self.save_command(&job)?,
            StoreCommand::ZRem {
                key: keys.active(&job.queue),
                member: job.id.clone(),
            },
        ];
        commands.extend(log_commands(
            keys.completed(&job.queue),
            serde_json::to_string(&job)?,
            self.inner.config.completed_log_limit,
        ));
        self.inner.store.exec(commands).await?;

        info!(
            queue = %job.queue,
            job_id = %job.id,
            attempts = job.attempts,
            duration_ms,
            "Job completed"
        );
        self.emit(QueueEvent::JobCompleted {
            job_id: job.id,
            job_type: job.job_type,
            queue: job.queue,
            attempts: job.attempts,
            duration_ms,
        });
        Ok(())
    }

    async fn fail(&self, mut job: Job, message: String, duration_ms: u64) -> AppResult<()> {
        let keys = &self.inner.keys;
        let now = Utc::now();
        job.last_error = Some(message.clone());

        if job.has_attempts_left() {
            let delay = self.inner.retry.delay_for_attempt(job.attempts);
            let retry_at = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
            job.status = JobStatus::Retrying;
            job.delay_until = Some(retry_at);

            let commands = vec![
                self.save_command(&job)?,
                StoreCommand::ZRem {
                    key: keys.active(&job.queue),
                    member: job.id.clone(),
                },
                StoreCommand::ZAdd {
                    key: keys.delayed(&job.queue),
                    score: retry_at.timestamp_millis() as f64,
                    member: job.id.clone(),
                },
            ];
            self.inner.store.exec(commands).await?;

            warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, scheduling retry"
            );
            self.emit(QueueEvent::JobRetrying {
                job_id: job.id,
                job_type: job.job_type,
                queue: job.queue,
                attempts: job.attempts,
                error: message,
                retry_at,
                duration_ms,
            });
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);

            let mut commands = vec![
                self.save_command(&job)?,
                StoreCommand::ZRem {
                    key: keys.active(&job.queue),
                    member: job.id.clone(),
                },
            ];
            commands.extend(log_commands(
                keys.failed(&job.queue),
                serde_json::to_string(&job)?,
                self.inner.config.failed_log_limit,
            ));
            self.inner.store.exec(commands).await?;

            error!(
                queue = %job.queue,
                job_id = %job.id,
                attempts = job.attempts,
                error = %message,
                "Job failed permanently"
            );
            self.emit(QueueEvent::JobFailed {
                job_id: job.id,
                job_type: job.job_type,
                queue: job.queue,
                attempts: job.attempts,
                error: message,
                duration_ms,
            });
        }
        Ok(())
    }
}

/// Push onto a log list and keep only the newest `limit` entries.
fn log_commands(key: String, entry: String, limit: usize) -> [StoreCommand; 2] {
    let stop = limit.max(1) as i64 - 1;
    [
        StoreCommand::LPush {
            key: key.clone(),
            value: entry,
        },
        StoreCommand::LTrim {
            key,
            start: 0,
            stop,
        },
    ]
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_commands_bound() {
        let [push, trim] = log_commands("log".into(), "entry".into(), 1000);
        assert!(matches!(push, StoreCommand::LPush { .. }));
        assert_eq!(
            trim,
            StoreCommand::LTrim {
                key: "log".into(),
                start: 0,
                stop: 999
            }
        );

        let [_, trim] = log_commands("log".into(), "entry".into(), 0);
        assert!(matches!(trim, StoreCommand::LTrim { stop: 0, .. }));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");

        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
