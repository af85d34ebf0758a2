//! Job handlers.

use std::future::Future;

use async_trait::async_trait;

use crate::job::Job;

/// Error returned by a handler. Counted as a failed attempt.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes jobs of one `(queue, type)` pair.
///
/// Implemented for async closures taking a [`Job`]:
///
/// ```
/// use bazaar_queue::{HandlerError, Job, JobHandler};
///
/// fn assert_handler(_: impl JobHandler) {}
///
/// assert_handler(|job: Job| async move {
///     tracing::info!(id = %job.id, "sending email");
///     Ok::<(), HandlerError>(())
/// });
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt.
    async fn handle(&self, job: Job) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        self(job).await
    }
}
