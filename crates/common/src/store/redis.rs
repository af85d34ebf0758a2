//! Redis store backed by a `fred` client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::{Client, Transaction};
use fred::interfaces::{
    ClientLike, KeysInterface, ListInterface, SortedSetsInterface, TransactionInterface,
};
use fred::types::config::{Config as RedisConfig, ReconnectPolicy};
use fred::types::{Expiration, SetOptions, Value};
use tracing::info;

use super::{KeyValueStore, StoreCommand, StoreReply};
use crate::{AppError, AppResult};

/// Redis-backed [`KeyValueStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<Client>,
}

impl RedisStore {
    /// Connect to Redis at the given URL.
    ///
    /// The client keeps reconnecting in the background after the initial
    /// connection, so an outage shows up as `is_connected() == false`.
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let config = RedisConfig::from_url(redis_url)?;
        let policy = ReconnectPolicy::new_exponential(0, 100, 30_000, 2);
        let client = Client::new(config, None, None, Some(policy));
        client.init().await?;

        info!("Connected to Redis store");

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn from_client(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Close the connection.
    pub async fn quit(&self) -> AppResult<()> {
        self.client.quit().await?;
        Ok(())
    }

    async fn queue_command(trx: &Transaction, command: StoreCommand) -> AppResult<()> {
        match command {
            StoreCommand::Get(key) => trx.get::<(), _>(key).await?,
            StoreCommand::Set { key, value, ttl } => {
                trx.set::<(), _, _>(key, value, ttl.map(expiration), None, false)
                    .await?;
            }
            StoreCommand::Incr(key) => trx.incr::<(), _>(key).await?,
            StoreCommand::Expire { key, ttl } => {
                trx.expire::<(), _>(key, ttl_secs(ttl), None).await?;
            }
            StoreCommand::Del(keys) => trx.del::<(), _>(keys).await?,
            StoreCommand::ZAdd { key, score, member } => {
                trx.zadd::<(), _, _>(key, None, None, false, false, (score, member))
                    .await?;
            }
            StoreCommand::ZRem { key, member } => trx.zrem::<(), _, _>(key, member).await?,
            StoreCommand::ZCard(key) => trx.zcard::<(), _>(key).await?,
            StoreCommand::LPush { key, value } => trx.lpush::<(), _, _>(key, value).await?,
            StoreCommand::LTrim { key, start, stop } => {
                trx.ltrim::<(), _>(key, start, stop).await?;
            }
            StoreCommand::LLen(key) => trx.llen::<(), _>(key).await?,
        }
        Ok(())
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

fn expiration(ttl: Duration) -> Expiration {
    Expiration::EX(ttl_secs(ttl))
}

fn to_reply(value: Value) -> StoreReply {
    match value {
        Value::Null => StoreReply::Nil,
        Value::Integer(n) => StoreReply::Int(n),
        Value::Boolean(b) => StoreReply::Int(i64::from(b)),
        other => other.as_string().map_or(StoreReply::Nil, StoreReply::Text),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.client.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.client
            .set::<(), _, _>(key, value, ttl.map(expiration), None, false)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        // NX returns None if the key already exists, Some("OK") if set
        let result: Option<String> = self
            .client
            .set(key, value, Some(expiration(ttl)), Some(SetOptions::NX), false)
            .await?;
        Ok(result.is_some())
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        Ok(self.client.incr(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let updated: i64 = self.client.expire(key, ttl_secs(ttl), None).await?;
        Ok(updated > 0)
    }

    async fn del(&self, keys: &[String]) -> AppResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.client.del(keys.to_vec()).await?)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let count: i64 = self.client.exists(key).await?;
        Ok(count > 0)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> AppResult<()> {
        self.client
            .zadd::<(), _, _>(key, None, None, false, false, (score, member))
            .await?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> AppResult<Option<(String, f64)>> {
        let value: Value = self.client.zpopmin(key, None).await?;
        let mut items = value.into_array().into_iter();

        let member = items.next().and_then(|v| v.as_string());
        let score = items.next().and_then(|v| v.as_f64());

        Ok(member.map(|m| (m, score.unwrap_or_default())))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> AppResult<Vec<String>> {
        Ok(self
            .client
            .zrangebyscore(key, min, max, false, Some((0, limit as i64)))
            .await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<u64> {
        Ok(self.client.zrem(key, member).await?)
    }

    async fn zcard(&self, key: &str) -> AppResult<u64> {
        Ok(self.client.zcard(key).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> AppResult<u64> {
        Ok(self.client.lpush(key, value).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> AppResult<()> {
        self.client.ltrim::<(), _>(key, start, stop).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> AppResult<u64> {
        Ok(self.client.llen(key).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>> {
        Ok(self.client.lrange(key, start, stop).await?)
    }

    async fn exec(&self, commands: Vec<StoreCommand>) -> AppResult<Vec<StoreReply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let expected = commands.len();
        let trx = self.client.multi();
        for command in commands {
            Self::queue_command(&trx, command).await?;
        }

        let result: Value = trx.exec(true).await?;
        let replies: Vec<StoreReply> = match result {
            Value::Array(values) => values.into_iter().map(to_reply).collect(),
            single => vec![to_reply(single)],
        };

        if replies.len() != expected {
            return Err(AppError::StoreUnavailable(format!(
                "transaction returned {} replies for {expected} commands",
                replies.len()
            )));
        }

        Ok(replies)
    }
}
