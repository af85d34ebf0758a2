//! Key-value store contract.
//!
//! The job queue and the rate limiter only talk to the store through
//! [`KeyValueStore`]. Two implementations are provided:
//!
//! - [`RedisStore`]: production backend over a `fred` client
//! - [`MemoryStore`]: in-process backend for tests and single-node development

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::AppResult;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// A single command inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// `GET key`
    Get(String),
    /// `SET key value [EX ttl]`
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// `INCR key`
    Incr(String),
    /// `EXPIRE key seconds`
    Expire { key: String, ttl: Duration },
    /// `DEL key [key ...]`
    Del(Vec<String>),
    /// `ZADD key score member`
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    /// `ZREM key member`
    ZRem { key: String, member: String },
    /// `ZCARD key`
    ZCard(String),
    /// `LPUSH key value`
    LPush { key: String, value: String },
    /// `LTRIM key start stop`
    LTrim { key: String, start: i64, stop: i64 },
    /// `LLEN key`
    LLen(String),
}

/// Reply to a single batched command. Status replies read as `Text("OK")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    /// Missing key or no value.
    Nil,
    /// Integer reply.
    Int(i64),
    /// Bulk string reply.
    Text(String),
}

impl StoreReply {
    /// Interpret the reply as an integer. `Nil` reads as zero.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Nil => Some(0),
            Self::Int(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
        }
    }

    /// Interpret the reply as a string.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(n) => Some(n.to_string()),
            Self::Nil => None,
        }
    }
}

/// Networked key-value / sorted-set / list store.
///
/// Every failure to reach the store surfaces as
/// [`AppError::StoreUnavailable`](crate::AppError::StoreUnavailable); callers
/// decide whether to fail open, degrade, or propagate.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Whether the client currently holds a live connection.
    fn is_connected(&self) -> bool;

    /// Get a string value.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Set a string value with an optional expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// Atomically set a value only if the key is absent. Returns whether it was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Increment an integer value, creating it at zero first.
    async fn incr(&self, key: &str) -> AppResult<i64>;

    /// Set a key's expiry. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> AppResult<u64>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> AppResult<()>;

    /// Atomically remove and return the lowest-scored member.
    async fn zpopmin(&self, key: &str) -> AppResult<Option<(String, f64)>>;

    /// Members with `min <= score <= max`, lowest first, at most `limit`.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> AppResult<Vec<String>>;

    /// Remove a sorted-set member, returning how many were removed.
    async fn zrem(&self, key: &str, member: &str) -> AppResult<u64>;

    /// Sorted-set cardinality.
    async fn zcard(&self, key: &str) -> AppResult<u64>;

    /// Push onto the head of a list, returning the new length.
    async fn lpush(&self, key: &str, value: &str) -> AppResult<u64>;

    /// Trim a list to the inclusive range `[start, stop]`.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> AppResult<()>;

    /// List length.
    async fn llen(&self, key: &str) -> AppResult<u64>;

    /// List elements in the inclusive range `[start, stop]`.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>>;

    /// Execute commands as one atomic batch.
    async fn exec(&self, commands: Vec<StoreCommand>) -> AppResult<Vec<StoreReply>>;
}
