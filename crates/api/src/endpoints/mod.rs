//! API endpoints.

mod jobs;
mod meta;
mod metrics;

use axum::{Router, middleware};

pub use jobs::{AddJobRequest, ClearResponse};

use crate::middleware::{AppState, metrics_middleware};

/// Create the application router.
///
/// Queue routes live under `/api`; `/health` and `/metrics` at the root.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(meta::router())
        .merge(metrics::router())
        .nest("/api", jobs::router(&state))
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics_middleware,
        ))
        .with_state(state)
}
