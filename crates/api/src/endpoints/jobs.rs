//! Job queue endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
};
use bazaar_common::{AppError, AppResult};
use bazaar_queue::{DEFAULT_MAX_ATTEMPTS, EnqueuedJob, Job, JobOptions, QueueStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::middleware::{AppState, RateLimitGuard, rate_limit_middleware};
use crate::rate_limit::limit_types;

/// Largest page returned by the log listing endpoints.
const MAX_LOG_PAGE: usize = 100;

/// Enqueue request body.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddJobRequest {
    /// Job type; selects the processor.
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 128))]
    pub job_type: String,
    /// Handler input.
    #[serde(default)]
    pub payload: Value,
    /// Delay in milliseconds before the job becomes eligible.
    pub delay: Option<i64>,
    /// Higher runs first.
    pub priority: Option<i32>,
    /// Total attempts before dead-lettering.
    pub max_attempts: Option<u32>,
    /// Deduplicate identical submissions. Defaults to `true`.
    pub idempotent: Option<bool>,
}

impl AddJobRequest {
    fn options(&self) -> JobOptions {
        JobOptions {
            delay: self.delay.unwrap_or(0),
            priority: self.priority.unwrap_or(0),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            idempotent: self.idempotent.unwrap_or(true),
        }
    }
}

/// Query for the log listing routes.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Entries to return, newest first.
    pub limit: Option<usize>,
}

/// Result of clearing a log.
#[derive(Debug, Serialize)]
pub struct ClearResponse {
    /// Entries removed.
    pub removed: u64,
}

/// Enqueue a job. `201` for a new job, `200` for a suppressed duplicate.
async fn add_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<AddJobRequest>,
) -> AppResult<(StatusCode, Json<EnqueuedJob>)> {
    req.validate()?;

    let added = state
        .queue
        .add_job(&queue, &req.job_type, &req.payload, req.options())
        .await?;

    let status = if added.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(added)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    state
        .queue
        .get_job_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))
}

async fn queue_stats(State(state): State<AppState>, Path(queue): Path<String>) -> Json<QueueStats> {
    Json(state.queue.get_queue_stats(&queue).await)
}

async fn recent_completed(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<Job>> {
    let limit = query.limit.unwrap_or(20).min(MAX_LOG_PAGE);
    Json(state.queue.recent_completed(&queue, limit).await)
}

async fn recent_failed(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<Job>> {
    let limit = query.limit.unwrap_or(20).min(MAX_LOG_PAGE);
    Json(state.queue.recent_failed(&queue, limit).await)
}

async fn clear_completed(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.queue.clear_completed_jobs(&queue).await,
    })
}

async fn clear_failed(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.queue.clear_failed_jobs(&queue).await,
    })
}

/// Create the job router. Submission is rate limited as general API traffic.
pub fn router(state: &AppState) -> Router<AppState> {
    let guard = RateLimitGuard::new(state.limiter.clone(), limit_types::API_GENERAL);

    let submit = Router::new()
        .route("/queues/{queue}/jobs", post(add_job))
        .route_layer(middleware::from_fn_with_state(guard, rate_limit_middleware));

    Router::new()
        .merge(submit)
        .route("/jobs/{id}", get(get_job))
        .route("/queues/{queue}/stats", get(queue_stats))
        .route(
            "/queues/{queue}/completed",
            get(recent_completed).delete(clear_completed),
        )
        .route("/queues/{queue}/failed", get(recent_failed).delete(clear_failed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_job_request_defaults() {
        let req: AddJobRequest =
            serde_json::from_value(json!({"type": "email", "payload": {"to": "a@b.com"}})).unwrap();
        let options = req.options();

        assert_eq!(options, JobOptions::default());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_add_job_request_options() {
        let req: AddJobRequest = serde_json::from_value(json!({
            "type": "email",
            "delay": 1500,
            "priority": 4,
            "maxAttempts": 5,
            "idempotent": false
        }))
        .unwrap();
        let options = req.options();

        assert_eq!(options.delay, 1500);
        assert_eq!(options.priority, 4);
        assert_eq!(options.max_attempts, 5);
        assert!(!options.idempotent);
        assert_eq!(req.payload, Value::Null);
    }

    #[test]
    fn test_add_job_request_rejects_empty_type() {
        let req: AddJobRequest = serde_json::from_value(json!({"type": ""})).unwrap();
        assert!(req.validate().is_err());
    }
}
