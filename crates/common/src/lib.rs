//! Common utilities and shared types for bazaar.
//!
//! This crate provides foundational components used across all bazaar crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Store**: Key-value store contract via [`KeyValueStore`], backed by
//!   Redis ([`RedisStore`]) or memory ([`MemoryStore`])
//! - **Metrics**: Counters and Prometheus export via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bazaar_common::{AppResult, Config, KeyValueStore, RedisStore};
//!
//! async fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.redis.url).await?);
//!     assert!(store.is_connected());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod store;

pub use config::{Config, QueueConfig, RateLimitPolicy};
pub use error::{AppError, AppResult};
pub use metrics::{JobOutcome, Metrics, MetricsSnapshot, Timer};
pub use store::{KeyValueStore, MemoryStore, RedisStore, StoreCommand, StoreReply};
