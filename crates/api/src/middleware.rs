//! API middleware.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bazaar_common::{AppError, Metrics, Timer};
use bazaar_queue::JobQueue;
use tracing::error;

use crate::rate_limit::{RateLimitInfo, SlidingWindowRateLimiter};

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Job queue.
    pub queue: JobQueue,
    /// Shared rate limiter.
    pub limiter: SlidingWindowRateLimiter,
    /// Request and job counters.
    pub metrics: Arc<Metrics>,
}

/// Caller identity placed in request extensions by an upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User id, used as the rate limit identifier.
    pub id: String,
}

/// Limiter plus the limit type a route group is checked against.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: SlidingWindowRateLimiter,
    limit_type: String,
}

impl RateLimitGuard {
    /// Check requests against `limit_type`.
    #[must_use]
    pub fn new(limiter: SlidingWindowRateLimiter, limit_type: &str) -> Self {
        Self {
            limiter,
            limit_type: limit_type.to_string(),
        }
    }
}

/// Rate limit error response.
#[derive(Debug)]
pub struct RateLimitError {
    /// The denied check.
    pub info: RateLimitInfo,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let retry_after = self.info.retry_after.unwrap_or(1);
        let mut response = AppError::RateLimited { retry_after }.into_response();
        insert_rate_limit_headers(response.headers_mut(), &self.info);
        response
    }
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert("X-RateLimit-Limit", info.limit.into());
    headers.insert("X-RateLimit-Remaining", info.remaining.into());
    headers.insert("X-RateLimit-Reset", info.reset_secs().into());
}

/// Extract client IP from forwarding headers.
fn forwarded_ip(req: &Request<Body>) -> Option<IpAddr> {
    if let Some(xff) = req.headers().get("x-forwarded-for")
        && let Ok(xff_str) = xff.to_str()
        && let Some(first_ip) = xff_str.split(',').next()
        && let Ok(ip) = first_ip.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(ip_str) = real_ip.to_str()
        && let Ok(ip) = ip_str.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    None
}

/// Key a request is counted under: user, then client IP, then `anonymous`.
#[must_use]
pub fn client_identifier(req: &Request<Body>) -> String {
    if let Some(user) = req.extensions().get::<AuthenticatedUser>() {
        return format!("user:{}", user.id);
    }

    let ip = forwarded_ip(req).or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    });

    match ip {
        Some(ip) => format!("ip:{ip}"),
        None => "anonymous".to_string(),
    }
}

/// Rate limiting middleware.
///
/// Unknown limit types let the request through.
pub async fn rate_limit_middleware(
    State(guard): State<RateLimitGuard>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    let identifier = client_identifier(&req);

    let info = match guard
        .limiter
        .check_rate_limit(&identifier, &guard.limit_type, None)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            error!(limit_type = %guard.limit_type, error = %e, "Rate limit check failed, allowing request");
            return Ok(next.run(req).await);
        }
    };

    if !info.allowed {
        return Err(RateLimitError { info });
    }

    let mut response = next.run(req).await;
    insert_rate_limit_headers(response.headers_mut(), &info);
    Ok(response)
}

/// Record request count, status class and latency.
pub async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let timer = Timer::start();
    let response = next.run(req).await;
    metrics.record_http_request(response.status().as_u16(), timer.elapsed());
    response
}
