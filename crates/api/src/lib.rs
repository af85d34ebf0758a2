//! HTTP API layer for bazaar.
//!
//! - **Rate limiting**: distributed sliding-window limiter and its middleware
//! - **Endpoints**: job submission, status, queue stats and log maintenance
//! - **Observability**: health check, Prometheus and JSON metrics
//!
//! Built on Axum 0.8 with Tower middleware stack.

pub mod endpoints;
pub mod middleware;
pub mod rate_limit;

pub use endpoints::router;
pub use middleware::{AppState, AuthenticatedUser, RateLimitGuard, rate_limit_middleware};
pub use rate_limit::{RateLimitInfo, SlidingWindowRateLimiter, default_policies, limit_types};
