//! Feeds queue lifecycle events into the metrics registry.

use std::sync::Arc;
use std::time::Duration;

use bazaar_common::{JobOutcome, Metrics};
use bazaar_queue::QueueEvent;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Apply one event to the counters.
pub fn record(metrics: &Metrics, event: &QueueEvent) {
    let run_time = Duration::from_millis(event.duration_ms().unwrap_or_default());

    match event {
        QueueEvent::JobAdded { is_new, .. } => metrics.record_job_added(*is_new),
        QueueEvent::JobStarted { .. } => metrics.record_job_started(),
        QueueEvent::JobCompleted { .. } => {
            metrics.record_job_finished(JobOutcome::Completed, run_time);
        }
        QueueEvent::JobRetrying { .. } => metrics.record_job_finished(JobOutcome::Retrying, run_time),
        QueueEvent::JobFailed { .. } => metrics.record_job_finished(JobOutcome::Failed, run_time),
    }
}

/// Consume events until the queue is dropped.
pub fn spawn(mut events: Receiver<QueueEvent>, metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => record(&metrics, &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Metrics observer lagged behind queue events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn added(is_new: bool) -> QueueEvent {
        QueueEvent::JobAdded {
            job_id: "email:1".into(),
            job_type: "email".into(),
            queue: "emails".into(),
            is_new,
        }
    }

    #[test]
    fn test_record_counts_outcomes() {
        let metrics = Metrics::new();

        record(&metrics, &added(true));
        record(&metrics, &added(false));
        record(
            &metrics,
            &QueueEvent::JobRetrying {
                job_id: "email:1".into(),
                job_type: "email".into(),
                queue: "emails".into(),
                attempts: 1,
                error: "smtp down".into(),
                retry_at: Utc::now(),
                duration_ms: 4,
            },
        );
        record(
            &metrics,
            &QueueEvent::JobCompleted {
                job_id: "email:1".into(),
                job_type: "email".into(),
                queue: "emails".into(),
                attempts: 2,
                duration_ms: 6,
            },
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_enqueued, 1);
        assert_eq!(snapshot.jobs_deduplicated, 1);
        assert_eq!(snapshot.jobs_retried, 1);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 0);
    }

    #[tokio::test]
    async fn test_observer_stops_when_sender_dropped() {
        let (tx, rx) = tokio::sync::broadcast::channel(8);
        let metrics = Arc::new(Metrics::new());
        let handle = spawn(rx, metrics.clone());

        tx.send(added(true)).ok();
        drop(tx);
        handle.await.ok();

        assert_eq!(metrics.snapshot().jobs_enqueued, 1);
    }
}
