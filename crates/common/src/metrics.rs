//! Metrics collection for bazaar.
//!
//! Atomic counters for HTTP traffic, rate limiting decisions and job queue
//! lifecycle, with a Prometheus text export. A single [`Metrics`] instance is
//! built at startup and shared behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Application metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Request Metrics ===
    /// Total HTTP requests received
    pub http_requests_total: AtomicU64,
    /// HTTP requests by status code category (2xx, 4xx, 5xx)
    pub http_requests_2xx: AtomicU64,
    pub http_requests_4xx: AtomicU64,
    pub http_requests_5xx: AtomicU64,
    /// Total request latency in microseconds
    pub http_request_latency_us_total: AtomicU64,

    // === Rate Limit Metrics ===
    /// Requests allowed by the rate limiter
    pub rate_limit_allowed: AtomicU64,
    /// Requests rejected by the rate limiter
    pub rate_limit_denied: AtomicU64,
    /// Checks that failed open because the store was unreachable
    pub rate_limit_fail_open: AtomicU64,

    // === Job Queue Metrics ===
    /// Jobs written by `add_job`
    pub jobs_enqueued: AtomicU64,
    /// Submissions answered with an existing job id
    pub jobs_deduplicated: AtomicU64,
    /// Attempts handed to a handler
    pub jobs_started: AtomicU64,
    /// Jobs finished successfully
    pub jobs_completed: AtomicU64,
    /// Failed attempts scheduled for retry
    pub jobs_retried: AtomicU64,
    /// Jobs moved to the failed log
    pub jobs_failed: AtomicU64,
    /// Total handler run time in microseconds
    pub job_run_time_us_total: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            http_requests_total: AtomicU64::new(0),
            http_requests_2xx: AtomicU64::new(0),
            http_requests_4xx: AtomicU64::new(0),
            http_requests_5xx: AtomicU64::new(0),
            http_request_latency_us_total: AtomicU64::new(0),

            rate_limit_allowed: AtomicU64::new(0),
            rate_limit_denied: AtomicU64::new(0),
            rate_limit_fail_open: AtomicU64::new(0),

            jobs_enqueued: AtomicU64::new(0),
            jobs_deduplicated: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            job_run_time_us_total: AtomicU64::new(0),
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, status_code: u16, latency: Duration) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);

        match status_code {
            200..=299 => self.http_requests_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.http_requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.http_requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        self.http_request_latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a rate limit decision.
    pub fn record_rate_limit(&self, allowed: bool) {
        if allowed {
            self.rate_limit_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rate_limit_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rate limit check that failed open.
    pub fn record_rate_limit_fail_open(&self) {
        self.rate_limit_fail_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an enqueue. `is_new == false` means the submission was deduplicated.
    pub fn record_job_added(&self, is_new: bool) {
        if is_new {
            self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a job execution starting.
    pub fn record_job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished attempt and its outcome.
    pub fn record_job_finished(&self, outcome: JobOutcome, run_time: Duration) {
        let counter = match outcome {
            JobOutcome::Completed => &self.jobs_completed,
            JobOutcome::Retrying => &self.jobs_retried,
            JobOutcome::Failed => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.job_run_time_us_total
            .fetch_add(run_time.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_requests_2xx: self.http_requests_2xx.load(Ordering::Relaxed),
            http_requests_4xx: self.http_requests_4xx.load(Ordering::Relaxed),
            http_requests_5xx: self.http_requests_5xx.load(Ordering::Relaxed),
            http_request_latency_avg_us: self.average_latency_us(),

            rate_limit_allowed: self.rate_limit_allowed.load(Ordering::Relaxed),
            rate_limit_denied: self.rate_limit_denied.load(Ordering::Relaxed),
            rate_limit_fail_open: self.rate_limit_fail_open.load(Ordering::Relaxed),

            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_deduplicated: self.jobs_deduplicated.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            job_run_time_avg_us: self.average_job_run_time_us(),
        }
    }

    fn average_latency_us(&self) -> u64 {
        let total = self.http_request_latency_us_total.load(Ordering::Relaxed);
        let count = self.http_requests_total.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }

    fn average_job_run_time_us(&self) -> u64 {
        let total = self.job_run_time_us_total.load(Ordering::Relaxed);
        let count = self.jobs_completed.load(Ordering::Relaxed)
            + self.jobs_retried.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }

    /// Render all metrics in the Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        write_metric(&mut output, "http_requests_total", "counter", "Total HTTP requests", s.http_requests_total);
        output.push_str("# HELP bazaar_http_requests_by_status HTTP requests by status class\n");
        output.push_str("# TYPE bazaar_http_requests_by_status counter\n");
        for (class, value) in [
            ("2xx", s.http_requests_2xx),
            ("4xx", s.http_requests_4xx),
            ("5xx", s.http_requests_5xx),
        ] {
            output.push_str(&format!(
                "bazaar_http_requests_by_status{{status=\"{class}\"}} {value}\n"
            ));
        }
        write_metric(&mut output, "http_request_latency_avg_us", "gauge", "Average request latency in microseconds", s.http_request_latency_avg_us);

        write_metric(&mut output, "rate_limit_allowed", "counter", "Requests allowed by the rate limiter", s.rate_limit_allowed);
        write_metric(&mut output, "rate_limit_denied", "counter", "Requests rejected by the rate limiter", s.rate_limit_denied);
        write_metric(&mut output, "rate_limit_fail_open", "counter", "Rate limit checks that failed open", s.rate_limit_fail_open);

        write_metric(&mut output, "jobs_enqueued", "counter", "Jobs enqueued", s.jobs_enqueued);
        write_metric(&mut output, "jobs_deduplicated", "counter", "Duplicate submissions suppressed", s.jobs_deduplicated);
        write_metric(&mut output, "jobs_started", "counter", "Job attempts started", s.jobs_started);
        write_metric(&mut output, "jobs_completed", "counter", "Jobs completed", s.jobs_completed);
        write_metric(&mut output, "jobs_retried", "counter", "Job attempts scheduled for retry", s.jobs_retried);
        write_metric(&mut output, "jobs_failed", "counter", "Jobs dead-lettered", s.jobs_failed);
        write_metric(&mut output, "job_run_time_avg_us", "gauge", "Average handler run time in microseconds", s.job_run_time_avg_us);

        output
    }
}

fn write_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP bazaar_{name} {help}\n"));
    output.push_str(&format!("# TYPE bazaar_{name} {kind}\n"));
    output.push_str(&format!("bazaar_{name} {value}\n"));
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Failed,
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    // HTTP
    pub http_requests_total: u64,
    pub http_requests_2xx: u64,
    pub http_requests_4xx: u64,
    pub http_requests_5xx: u64,
    pub http_request_latency_avg_us: u64,

    // Rate limiting
    pub rate_limit_allowed: u64,
    pub rate_limit_denied: u64,
    pub rate_limit_fail_open: u64,

    // Jobs
    pub jobs_enqueued: u64,
    pub jobs_deduplicated: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub job_run_time_avg_us: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
