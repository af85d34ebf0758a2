//! Job records, enqueue options and idempotency keys.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use validator::Validate;

/// Default attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Hex characters of the SHA-256 digest kept in idempotency keys and job ids.
const HASH_LEN: usize = 32;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to run, either ready or delayed.
    Pending,
    /// Handed to a handler.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts.
    Failed,
    /// Waiting out a backoff delay after a failed attempt.
    Retrying,
}

impl JobStatus {
    /// Whether no further transitions happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique id; derived from the idempotency hash for idempotent jobs.
    pub id: String,
    /// Queue the job belongs to.
    pub queue: String,
    /// Selects the handler.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Handler input.
    pub payload: Value,
    /// Times execution has been tried.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
    /// Higher runs first.
    pub priority: i32,
    /// Earliest time the job may run.
    pub delay_until: Option<DateTime<Utc>>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set once the job completes or fails permanently.
    pub finished_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a pending job.
    #[must_use]
    pub fn new(
        id: String,
        queue: &str,
        job_type: &str,
        payload: Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay_until =
            (options.delay > 0).then(|| now + ChronoDuration::milliseconds(options.delay));

        Self {
            id,
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts,
            priority: options.priority,
            delay_until,
            created_at: now,
            last_attempt_at: None,
            finished_at: None,
            status: JobStatus::Pending,
            last_error: None,
        }
    }

    /// Score in the waiting set. Lowest pops first, so priority is negated.
    #[must_use]
    pub fn ready_score(&self) -> f64 {
        -f64::from(self.priority)
    }

    /// Score in the delayed set: `delay_until` in epoch milliseconds.
    #[must_use]
    pub fn delayed_score(&self) -> Option<f64> {
        self.delay_until.map(|at| at.timestamp_millis() as f64)
    }

    /// Whether another attempt is allowed after the current one failed.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Options recognized by `add_job`. Unset fields take the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Delay before the job becomes eligible, in milliseconds.
    #[validate(range(min = 0, message = "delay must not be negative"))]
    pub delay: i64,
    /// Higher runs first among ready jobs.
    pub priority: i32,
    /// Total attempts before the job is dead-lettered.
    #[validate(range(min = 1, max = 100, message = "maxAttempts must be between 1 and 100"))]
    pub max_attempts: u32,
    /// Deduplicate identical `(queue, type, payload)` submissions.
    pub idempotent: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotent: true,
        }
    }
}

impl JobOptions {
    /// Delay eligibility by `delay` milliseconds.
    #[must_use]
    pub const fn with_delay_ms(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the total attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Always create a new job with a random id.
    #[must_use]
    pub const fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// Result of `add_job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    /// Id of the new job, or of the live job that suppressed this submission.
    pub id: String,
    /// `false` when an identical live job already existed.
    pub is_new: bool,
}

/// Set sizes for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to run.
    pub waiting: u64,
    /// Running.
    pub active: u64,
    /// Entries in the completed log.
    pub completed: u64,
    /// Entries in the failed log.
    pub failed: u64,
    /// Delayed or waiting out a retry backoff.
    pub delayed: u64,
    /// Sum of the above.
    pub total: u64,
}

/// Serialize JSON with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Content hash identifying a logical unit of work.
#[must_use]
pub fn idempotency_hash(queue: &str, job_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update([0u8]);
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(HASH_LEN);
    digest
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,{"d":2,"c":3}],"x":null}}"#).unwrap();
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"x":null,"y":[1,{"c":3,"d":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_idempotency_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"to":"a@b.com","subject":"hi"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"subject":"hi","to":"a@b.com"}"#).unwrap();

        assert_eq!(
            idempotency_hash("q", "email", &a),
            idempotency_hash("q", "email", &b)
        );
        assert_eq!(idempotency_hash("q", "email", &a).len(), 32);
    }

    #[test]
    fn test_idempotency_hash_separates_fields() {
        let payload = json!({});
        assert_ne!(
            idempotency_hash("ab", "c", &payload),
            idempotency_hash("a", "bc", &payload)
        );
        assert_ne!(
            idempotency_hash("q", "email", &json!({"n": 1})),
            idempotency_hash("q", "email", &json!({"n": 2}))
        );
    }

    #[test]
    fn test_job_options_defaults_and_validation() {
        let options = JobOptions::default();
        assert_eq!(options.max_attempts, 3);
        assert!(options.idempotent);
        assert!(options.validate().is_ok());

        assert!(JobOptions::default().with_delay_ms(-1).validate().is_err());
        assert!(JobOptions::default().with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn test_job_options_deserialize_partial() {
        let options: JobOptions = serde_json::from_value(json!({"priority": 5})).unwrap();
        assert_eq!(options.priority, 5);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.delay, 0);
    }

    #[test]
    fn test_new_job_scores() {
        let now = Utc::now();
        let options = JobOptions::default().with_priority(5).with_delay_ms(2000);
        let job = Job::new("email:x".into(), "q", "email", json!({}), &options, now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.ready_score(), -5.0);
        assert_eq!(
            job.delayed_score(),
            Some((now.timestamp_millis() + 2000) as f64)
        );
    }

    #[test]
    fn test_job_serializes_type_field() {
        let job = Job::new(
            "email:x".into(),
            "q",
            "email",
            json!({"to": "a@b.com"}),
            &JobOptions::default(),
            Utc::now(),
        );
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "email");
        assert_eq!(value["maxAttempts"], 3);
        assert_eq!(value["status"], "pending");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
