//! Idempotent background job queue for bazaar.
//!
//! Jobs are kept in a Redis-compatible store behind
//! [`KeyValueStore`](bazaar_common::KeyValueStore):
//!
//! - **Enqueue**: [`JobQueue::add_job`] with content-hash idempotency
//! - **Scheduling**: priority-ordered ready set, delayed set for deferred work
//! - **Workers**: [`JobQueue::start_processing`] polls with a concurrency cap
//! - **Retry**: linear backoff via [`RetryConfig`], dead-lettering to a bounded failed log
//! - **Events**: lifecycle notifications via [`JobQueue::subscribe`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use bazaar_common::{MemoryStore, QueueConfig};
//! use bazaar_queue::{HandlerError, Job, JobOptions, JobQueue};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bazaar_common::AppResult<()> {
//! let queue = JobQueue::new(Arc::new(MemoryStore::new()), "bazaar", QueueConfig::default());
//!
//! queue
//!     .register_processor("emails", "welcome", |job: Job| async move {
//!         tracing::info!(id = %job.id, "sending welcome email");
//!         Ok::<(), HandlerError>(())
//!     })
//!     .await;
//!
//! let first = queue
//!     .add_job("emails", "welcome", &serde_json::json!({"user": 1}), JobOptions::default())
//!     .await?;
//! let again = queue
//!     .add_job("emails", "welcome", &serde_json::json!({"user": 1}), JobOptions::default())
//!     .await?;
//! assert_eq!(first.id, again.id);
//! assert!(!again.is_new);
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod retry;
mod worker;

pub use events::QueueEvent;
pub use handler::{HandlerError, JobHandler};
pub use job::{
    DEFAULT_MAX_ATTEMPTS, EnqueuedJob, Job, JobOptions, JobStatus, QueueStats, canonical_json,
    idempotency_hash,
};
pub use queue::JobQueue;
pub use retry::{BackoffStrategy, RetryConfig};
