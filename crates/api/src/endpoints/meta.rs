//! Health endpoint.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::middleware::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// `up` or `down`.
    pub store: &'static str,
}

/// Liveness plus store connectivity. `503` while the store is unreachable.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.queue.store_connected();
    let (status, code) = if connected {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            store: if connected { "up" } else { "down" },
        }),
    )
}

/// Health routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
