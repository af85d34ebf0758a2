//! Job lifecycle events.
//!
//! Observers call [`JobQueue::subscribe`](crate::JobQueue::subscribe) and
//! receive every event published after subscribing. Dropping the receiver
//! unsubscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// `add_job` returned; `is_new` is false for a suppressed duplicate.
    JobAdded {
        job_id: String,
        job_type: String,
        queue: String,
        is_new: bool,
    },
    /// A worker picked the job up.
    JobStarted {
        job_id: String,
        job_type: String,
        queue: String,
        attempt: u32,
    },
    /// The handler succeeded.
    JobCompleted {
        job_id: String,
        job_type: String,
        queue: String,
        attempts: u32,
        duration_ms: u64,
    },
    /// The handler failed and the job was rescheduled.
    JobRetrying {
        job_id: String,
        job_type: String,
        queue: String,
        attempts: u32,
        error: String,
        retry_at: DateTime<Utc>,
        duration_ms: u64,
    },
    /// The handler failed on the last allowed attempt.
    JobFailed {
        job_id: String,
        job_type: String,
        queue: String,
        attempts: u32,
        error: String,
        duration_ms: u64,
    },
}

impl QueueEvent {
    /// Event name as published.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "jobAdded",
            Self::JobStarted { .. } => "jobStarted",
            Self::JobCompleted { .. } => "jobCompleted",
            Self::JobRetrying { .. } => "jobRetrying",
            Self::JobFailed { .. } => "jobFailed",
        }
    }

    /// Handler run time for events that end an attempt.
    #[must_use]
    pub const fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::JobCompleted { duration_ms, .. }
            | Self::JobRetrying { duration_ms, .. }
            | Self::JobFailed { duration_ms, .. } => Some(*duration_ms),
            Self::JobAdded { .. } | Self::JobStarted { .. } => None,
        }
    }

    /// Id of the job the event is about.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobAdded { job_id, .. }
            | Self::JobStarted { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobRetrying { job_id, .. }
            | Self::JobFailed { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = QueueEvent::JobAdded {
            job_id: "email:abc".to_string(),
            job_type: "email".to_string(),
            queue: "q".to_string(),
            is_new: true,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["jobId"], "email:abc");
        assert_eq!(json["isNew"], true);
        assert_eq!(event.job_id(), "email:abc");
        assert_eq!(event.duration_ms(), None);
    }

    #[test]
    fn test_failed_event_fields() {
        let event = QueueEvent::JobFailed {
            job_id: "email:abc".to_string(),
            job_type: "email".to_string(),
            queue: "q".to_string(),
            attempts: 3,
            error: "smtp down".to_string(),
            duration_ms: 12,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "jobFailed");
        assert_eq!(json["durationMs"], 12);
        assert_eq!(json["error"], "smtp down");
        assert_eq!(event.duration_ms(), Some(12));
    }
}
