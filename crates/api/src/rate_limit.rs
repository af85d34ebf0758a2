//! Sliding-window rate limiting.
//!
//! Each `(limit type, identifier)` pair keeps one counter per fixed window in
//! the store. A check weights the previous window's counter by how much of it
//! still overlaps the sliding window:
//!
//! ```text
//! count = floor(previous × (1 − elapsed / window) + current)
//! ```
//!
//! Counters are shared by every process talking to the same store. When the
//! store cannot be reached the limiter fails open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bazaar_common::{
    AppError, AppResult, KeyValueStore, Metrics, RateLimitPolicy, StoreCommand, StoreReply,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Built-in limit type names.
pub mod limit_types {
    /// General API traffic.
    pub const API_GENERAL: &str = "API_GENERAL";
    /// Login attempts.
    pub const LOGIN_ATTEMPTS: &str = "LOGIN_ATTEMPTS";
    /// Account registration.
    pub const REGISTRATION: &str = "REGISTRATION";
    /// Password reset requests.
    pub const PASSWORD_RESET: &str = "PASSWORD_RESET";
    /// Search queries.
    pub const SEARCH: &str = "SEARCH";
    /// Listing creation.
    pub const ITEM_CREATION: &str = "ITEM_CREATION";
    /// Trade proposals.
    pub const TRADE_CREATION: &str = "TRADE_CREATION";
    /// Direct messages.
    pub const MESSAGE_SEND: &str = "MESSAGE_SEND";
    /// Image uploads.
    pub const IMAGE_UPLOAD: &str = "IMAGE_UPLOAD";
}

/// Policies registered when a limiter is created.
#[must_use]
pub fn default_policies() -> HashMap<String, RateLimitPolicy> {
    use limit_types::{
        API_GENERAL, IMAGE_UPLOAD, ITEM_CREATION, LOGIN_ATTEMPTS, MESSAGE_SEND, PASSWORD_RESET,
        REGISTRATION, SEARCH, TRADE_CREATION,
    };

    [
        (API_GENERAL, RateLimitPolicy::new(60, 100)),
        (LOGIN_ATTEMPTS, RateLimitPolicy::new(300, 5)),
        (REGISTRATION, RateLimitPolicy::new(3600, 3)),
        (PASSWORD_RESET, RateLimitPolicy::new(3600, 3)),
        (SEARCH, RateLimitPolicy::new(60, 30)),
        (ITEM_CREATION, RateLimitPolicy::new(3600, 20)),
        (TRADE_CREATION, RateLimitPolicy::new(3600, 10)),
        (MESSAGE_SEND, RateLimitPolicy::new(60, 20)),
        (IMAGE_UPLOAD, RateLimitPolicy::new(3600, 50)),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Maximum requests per window.
    pub limit: u64,
    /// Requests left before the limit is hit.
    pub remaining: u64,
    /// End of the current window, epoch milliseconds.
    pub reset_time: i64,
    /// Seconds until the current window ends. Set only when denied.
    pub retry_after: Option<u64>,
}

impl RateLimitInfo {
    /// End of the current window, epoch seconds.
    #[must_use]
    pub const fn reset_secs(&self) -> i64 {
        self.reset_time.div_euclid(1000)
    }

    fn fail_open(policy: RateLimitPolicy, window_end: i64) -> Self {
        Self {
            allowed: true,
            limit: policy.max,
            remaining: policy.max,
            reset_time: window_end,
            retry_after: None,
        }
    }
}

/// `[start, end)` of the fixed window containing `now_ms`.
#[must_use]
pub const fn window_bounds(now_ms: i64, window_ms: i64) -> (i64, i64) {
    let window_ms = if window_ms > 0 { window_ms } else { 1 };
    let start = now_ms.div_euclid(window_ms) * window_ms;
    (start, start + window_ms)
}

/// Weighted request count over the sliding window.
#[must_use]
pub fn sliding_count(previous: u64, current: u64, elapsed_fraction: f64) -> u64 {
    let weight = 1.0 - elapsed_fraction.clamp(0.0, 1.0);
    (previous as f64).mul_add(weight, current as f64).floor().max(0.0) as u64
}

/// Normalized limit type name. Lookups ignore case.
fn normalize_type(limit_type: &str) -> String {
    limit_type.trim().to_ascii_uppercase()
}

/// Distributed sliding-window rate limiter.
///
/// Cheap to clone; clones share the policy table.
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    policies: Arc<RwLock<HashMap<String, RateLimitPolicy>>>,
    metrics: Option<Arc<Metrics>>,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter with the default policies.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        Self::with_policies(store, prefix, HashMap::new())
    }

    /// Create a limiter with `overrides` merged over the default policies.
    #[must_use]
    pub fn with_policies(
        store: Arc<dyn KeyValueStore>,
        prefix: &str,
        overrides: HashMap<String, RateLimitPolicy>,
    ) -> Self {
        let mut policies: HashMap<String, RateLimitPolicy> = default_policies();
        for (name, policy) in overrides {
            if policy.window == 0 || policy.max == 0 {
                warn!(limit_type = %name, "Ignoring rate limit policy with zero window or max");
                continue;
            }
            policies.insert(normalize_type(&name), policy);
        }

        Self {
            store,
            prefix: prefix.trim_end_matches(':').to_string(),
            policies: Arc::new(RwLock::new(policies)),
            metrics: None,
        }
    }

    /// Record decisions in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add or replace the policy for a limit type.
    pub async fn register_policy(&self, limit_type: &str, policy: RateLimitPolicy) -> AppResult<()> {
        if policy.window == 0 || policy.max == 0 {
            return Err(AppError::Validation(
                "rate limit window and max must be positive".to_string(),
            ));
        }

        let name = normalize_type(limit_type);
        debug!(limit_type = %name, window = policy.window, max = policy.max, "Registered rate limit policy");
        self.policies.write().await.insert(name, policy);
        Ok(())
    }

    /// Registered policy for a limit type.
    pub async fn policy(&self, limit_type: &str) -> Option<RateLimitPolicy> {
        self.policies
            .read()
            .await
            .get(&normalize_type(limit_type))
            .copied()
    }

    /// Count a request and decide whether it is allowed.
    ///
    /// `policy` overrides the registered policy for `limit_type`. Fails with
    /// [`AppError::UnknownLimitType`] when neither exists; store failures
    /// never surface and yield an allowed result instead.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        limit_type: &str,
        policy: Option<RateLimitPolicy>,
    ) -> AppResult<RateLimitInfo> {
        let name = normalize_type(limit_type);
        let policy = match policy {
            Some(policy) if policy.window > 0 && policy.max > 0 => policy,
            Some(_) => {
                return Err(AppError::Validation(
                    "rate limit window and max must be positive".to_string(),
                ));
            }
            None => self
                .policy(&name)
                .await
                .ok_or_else(|| AppError::UnknownLimitType(limit_type.to_string()))?,
        };

        let now_ms = Utc::now().timestamp_millis();
        Ok(self.check_at(identifier, &name, policy, now_ms).await)
    }

    async fn check_at(
        &self,
        identifier: &str,
        limit_type: &str,
        policy: RateLimitPolicy,
        now_ms: i64,
    ) -> RateLimitInfo {
        let window_ms = policy.window_millis();
        let (start, end) = window_bounds(now_ms, window_ms);

        if !self.store.is_connected() {
            return self.fail_open(identifier, limit_type, policy, end, "store not connected");
        }

        let current_key = self.key(limit_type, identifier, start);
        let previous_key = self.key(limit_type, identifier, start - window_ms);

        let replies = self
            .store
            .exec(vec![
                StoreCommand::Incr(current_key.clone()),
                StoreCommand::Expire {
                    key: current_key,
                    ttl: Duration::from_secs(policy.window * 2),
                },
                StoreCommand::Get(previous_key),
            ])
            .await;

        let replies = match replies {
            Ok(replies) => replies,
            Err(e) => {
                return self.fail_open(identifier, limit_type, policy, end, &e.to_string());
            }
        };

        let current = reply_count(replies.first());
        let previous = reply_count(replies.get(2));
        let elapsed = (now_ms - start) as f64 / window_ms as f64;
        let count = sliding_count(previous, current, elapsed);

        let allowed = count <= policy.max;
        let info = RateLimitInfo {
            allowed,
            limit: policy.max,
            remaining: policy.max.saturating_sub(count),
            reset_time: end,
            retry_after: (!allowed).then(|| retry_after_secs(now_ms, end)),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limit(allowed);
        }
        if !allowed {
            debug!(identifier, limit_type, count, max = policy.max, "Rate limit exceeded");
        }

        info
    }

    /// Delete the current and previous window counters.
    ///
    /// Returns `false` for an unknown type or an unreachable store.
    pub async fn reset_rate_limit(&self, identifier: &str, limit_type: &str) -> bool {
        let name = normalize_type(limit_type);
        let Some(policy) = self.policy(&name).await else {
            return false;
        };

        let window_ms = policy.window_millis();
        let (start, _) = window_bounds(Utc::now().timestamp_millis(), window_ms);
        let keys = [
            self.key(&name, identifier, start),
            self.key(&name, identifier, start - window_ms),
        ];

        match self.store.del(&keys).await {
            Ok(_) => {
                debug!(identifier, limit_type = %name, "Rate limit reset");
                true
            }
            Err(e) => {
                warn!(identifier, limit_type = %name, error = %e, "Failed to reset rate limit");
                false
            }
        }
    }

    /// Current standing without counting a request.
    ///
    /// `allowed` reports whether one more request would fit. `None` for an
    /// unknown type or an unreachable store.
    pub async fn get_rate_limit_status(
        &self,
        identifier: &str,
        limit_type: &str,
    ) -> Option<RateLimitInfo> {
        let name = normalize_type(limit_type);
        let policy = self.policy(&name).await?;
        self.status_at(identifier, &name, policy, Utc::now().timestamp_millis())
            .await
    }

    async fn status_at(
        &self,
        identifier: &str,
        limit_type: &str,
        policy: RateLimitPolicy,
        now_ms: i64,
    ) -> Option<RateLimitInfo> {
        let window_ms = policy.window_millis();
        let (start, end) = window_bounds(now_ms, window_ms);

        let replies = self
            .store
            .exec(vec![
                StoreCommand::Get(self.key(limit_type, identifier, start)),
                StoreCommand::Get(self.key(limit_type, identifier, start - window_ms)),
            ])
            .await
            .map_err(|e| warn!(identifier, limit_type, error = %e, "Failed to read rate limit status"))
            .ok()?;

        let elapsed = (now_ms - start) as f64 / window_ms as f64;
        let count = sliding_count(reply_count(replies.get(1)), reply_count(replies.first()), elapsed);
        let allowed = count < policy.max;

        Some(RateLimitInfo {
            allowed,
            limit: policy.max,
            remaining: policy.max.saturating_sub(count),
            reset_time: end,
            retry_after: (!allowed).then(|| retry_after_secs(now_ms, end)),
        })
    }

    fn fail_open(
        &self,
        identifier: &str,
        limit_type: &str,
        policy: RateLimitPolicy,
        window_end: i64,
        reason: &str,
    ) -> RateLimitInfo {
        warn!(identifier, limit_type, reason, "Rate limit check failed open");
        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limit_fail_open();
        }
        RateLimitInfo::fail_open(policy, window_end)
    }

    fn key(&self, limit_type: &str, identifier: &str, window_start: i64) -> String {
        format!(
            "{}:ratelimit:{limit_type}:{identifier}:{window_start}",
            self.prefix
        )
    }
}

fn reply_count(reply: Option<&StoreReply>) -> u64 {
    reply
        .and_then(StoreReply::as_int)
        .unwrap_or_default()
        .max(0) as u64
}

/// Whole seconds until `end_ms`, rounded up.
fn retry_after_secs(now_ms: i64, end_ms: i64) -> u64 {
    let remaining = (end_ms - now_ms).max(0) as u64;
    remaining.div_ceil(1000).max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bazaar_common::MemoryStore;

    const T0: i64 = 1_700_000_100_000;

    fn limiter() -> (SlidingWindowRateLimiter, MemoryStore) {
        let store = MemoryStore::new();
        let limiter = SlidingWindowRateLimiter::new(Arc::new(store.clone()), "test");
        (limiter, store)
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(window_bounds(1_000, 60_000), (0, 60_000));
        assert_eq!(window_bounds(60_000, 60_000), (60_000, 120_000));
        assert_eq!(window_bounds(119_999, 60_000), (60_000, 120_000));
    }

    #[test]
    fn test_sliding_count() {
        assert_eq!(sliding_count(0, 3, 0.2), 3);
        assert_eq!(sliding_count(10, 0, 0.0), 10);
        assert_eq!(sliding_count(10, 2, 0.5), 7);
        assert_eq!(sliding_count(10, 2, 1.0), 2);
        assert_eq!(sliding_count(3, 1, 0.9), 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(0, 1), 1);
        assert_eq!(retry_after_secs(0, 1_000), 1);
        assert_eq!(retry_after_secs(0, 1_001), 2);
        assert_eq!(retry_after_secs(0, 300_000), 300);
    }

    #[test]
    fn test_default_policies() {
        let policies = default_policies();
        assert_eq!(policies.len(), 9);
        assert_eq!(policies[limit_types::LOGIN_ATTEMPTS], RateLimitPolicy::new(300, 5));
        assert_eq!(policies[limit_types::API_GENERAL], RateLimitPolicy::new(60, 100));
    }

    #[tokio::test]
    async fn test_login_attempts_sixth_is_denied() {
        let (limiter, _) = limiter();
        let policy = limiter.policy(limit_types::LOGIN_ATTEMPTS).await.unwrap();

        for n in 1..=5u64 {
            let info = limiter.check_at("ip:1.2.3.4", "LOGIN_ATTEMPTS", policy, T0 + n as i64).await;
            assert!(info.allowed);
            assert_eq!(info.remaining, 5 - n);
            assert_eq!(info.retry_after, None);
        }

        let info = limiter.check_at("ip:1.2.3.4", "LOGIN_ATTEMPTS", policy, T0 + 10).await;
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
        let retry_after = info.retry_after.unwrap();
        assert!(retry_after > 0 && retry_after <= 300);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _) = limiter();
        let policy = RateLimitPolicy::new(60, 1);

        assert!(limiter.check_at("user:a", "SEARCH", policy, T0).await.allowed);
        assert!(!limiter.check_at("user:a", "SEARCH", policy, T0).await.allowed);
        assert!(limiter.check_at("user:b", "SEARCH", policy, T0).await.allowed);
    }

    #[tokio::test]
    async fn test_previous_window_is_weighted() {
        let (limiter, _) = limiter();
        let policy = RateLimitPolicy::new(60, 100);
        let (start, end) = window_bounds(T0, 60_000);

        for _ in 0..10 {
            limiter.check_at("user:a", "API_GENERAL", policy, start).await;
        }

        // Halfway through the next window: floor(10 × 0.5 + 1) = 6.
        let info = limiter
            .check_at("user:a", "API_GENERAL", policy, end + 30_000)
            .await;
        assert_eq!(info.remaining, 94);

        // Two windows later the first window no longer counts.
        let info = limiter
            .check_at("user:a", "API_GENERAL", policy, end + 120_000)
            .await;
        assert_eq!(info.remaining, 99);
    }

    #[tokio::test]
    async fn test_count_never_decreases_within_window() {
        let (limiter, _) = limiter();
        let policy = RateLimitPolicy::new(60, 1_000);
        let (start, end) = window_bounds(T0, 60_000);

        for _ in 0..20 {
            limiter.check_at("user:a", "API_GENERAL", policy, start + 100).await;
        }

        let mut last_remaining = u64::MAX;
        for step in 0..30 {
            let now = end + step * 2_000;
            let info = limiter.check_at("user:a", "API_GENERAL", policy, now).await;
            assert!(info.remaining <= last_remaining);
            assert!(info.remaining <= policy.max);
            last_remaining = info.remaining;
        }
    }

    #[tokio::test]
    async fn test_denied_requests_still_count() {
        let (limiter, _) = limiter();
        let policy = RateLimitPolicy::new(60, 2);

        for _ in 0..5 {
            limiter.check_at("user:a", "SEARCH", policy, T0).await;
        }

        let status = limiter.status_at("user:a", "SEARCH", policy, T0).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_an_error() {
        let (limiter, _) = limiter();
        let result = limiter.check_rate_limit("user:a", "NOPE", None).await;
        assert!(matches!(result, Err(AppError::UnknownLimitType(_))));
    }

    #[tokio::test]
    async fn test_explicit_policy_overrides_registered() {
        let (limiter, _) = limiter();
        let info = limiter
            .check_rate_limit("user:a", "NOPE", Some(RateLimitPolicy::new(60, 7)))
            .await
            .unwrap();
        assert!(info.allowed);
        assert_eq!(info.limit, 7);
        assert_eq!(info.remaining, 6);
    }

    #[tokio::test]
    async fn test_type_lookup_ignores_case() {
        let (limiter, _) = limiter();
        let info = limiter
            .check_rate_limit("user:a", "login_attempts", None)
            .await
            .unwrap();
        assert_eq!(info.limit, 5);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let (limiter, store) = limiter();
        let metrics = Arc::new(Metrics::new());
        let limiter = limiter.with_metrics(metrics.clone());
        store.set_available(false);

        for _ in 0..10 {
            let info = limiter
                .check_rate_limit("user:a", "LOGIN_ATTEMPTS", None)
                .await
                .unwrap();
            assert!(info.allowed);
            assert_eq!(info.remaining, 5);
        }
        assert_eq!(metrics.snapshot().rate_limit_fail_open, 10);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let (limiter, _) = limiter();

        for _ in 0..5 {
            limiter
                .check_rate_limit("user:a", "LOGIN_ATTEMPTS", None)
                .await
                .unwrap();
        }
        assert!(limiter.reset_rate_limit("user:a", "LOGIN_ATTEMPTS").await);

        let info = limiter
            .check_rate_limit("user:a", "LOGIN_ATTEMPTS", None)
            .await
            .unwrap();
        assert!(info.allowed);
        assert_eq!(info.remaining, 4);

        assert!(!limiter.reset_rate_limit("user:a", "NOPE").await);
    }

    #[tokio::test]
    async fn test_status_does_not_count() {
        let (limiter, store) = limiter();

        limiter
            .check_rate_limit("user:a", "SEARCH", None)
            .await
            .unwrap();
        for _ in 0..3 {
            let status = limiter.get_rate_limit_status("user:a", "SEARCH").await.unwrap();
            assert!(status.allowed);
            assert_eq!(status.remaining, 29);
        }

        assert!(limiter.get_rate_limit_status("user:a", "NOPE").await.is_none());
        store.set_available(false);
        assert!(limiter.get_rate_limit_status("user:a", "SEARCH").await.is_none());
    }

    #[tokio::test]
    async fn test_register_policy() {
        let (limiter, _) = limiter();

        limiter
            .register_policy("bulk_export", RateLimitPolicy::new(3600, 2))
            .await
            .unwrap();
        assert_eq!(
            limiter.policy("BULK_EXPORT").await,
            Some(RateLimitPolicy::new(3600, 2))
        );
        assert!(
            limiter
                .register_policy("broken", RateLimitPolicy::new(0, 2))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_config_overrides_merge_over_defaults() {
        let overrides = HashMap::from([
            ("search".to_string(), RateLimitPolicy::new(10, 3)),
            ("ZERO".to_string(), RateLimitPolicy::new(10, 0)),
        ]);
        let limiter =
            SlidingWindowRateLimiter::with_policies(Arc::new(MemoryStore::new()), "test", overrides);

        assert_eq!(limiter.policy("SEARCH").await, Some(RateLimitPolicy::new(10, 3)));
        assert_eq!(limiter.policy("ZERO").await, None);
        assert!(limiter.policy("LOGIN_ATTEMPTS").await.is_some());
    }
}
