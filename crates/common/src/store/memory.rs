//! In-process store with Redis semantics for the subset the services use.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KeyValueStore, StoreCommand, StoreReply};
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str) -> AppResult<Option<String>> {
        match self.live(key).map(|e| &e.data) {
            None => Ok(None),
            Some(Data::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset(&mut self, key: &str) -> AppResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key).map(|e| &mut e.data) {
            None => Ok(None),
            Some(Data::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str) -> AppResult<Option<&mut VecDeque<String>>> {
        match self.live(key).map(|e| &mut e.data) {
            None => Ok(None),
            Some(Data::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_members(&mut self, key: &str) -> AppResult<Vec<(String, f64)>> {
        let mut members: Vec<(String, f64)> = self
            .zset(key)?
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        // Redis orders equal scores lexicographically by member.
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.data) {
            Some(Data::ZSet(z)) => z.is_empty(),
            Some(Data::List(l)) => l.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, command: StoreCommand) -> AppResult<StoreReply> {
        match command {
            StoreCommand::Get(key) => Ok(self.string(&key)?.map_or(StoreReply::Nil, StoreReply::Text)),
            StoreCommand::Set { key, value, ttl } => {
                self.entries.insert(
                    key,
                    Entry {
                        data: Data::Str(value),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(StoreReply::Text("OK".to_string()))
            }
            StoreCommand::Incr(key) => {
                let current = match self.string(&key)? {
                    None => 0,
                    Some(s) => s
                        .parse::<i64>()
                        .map_err(|_| AppError::Internal(format!("value at {key} is not an integer")))?,
                };
                let next = current + 1;
                let expires_at = self.live(&key).and_then(|e| e.expires_at);
                self.entries.insert(
                    key,
                    Entry {
                        data: Data::Str(next.to_string()),
                        expires_at,
                    },
                );
                Ok(StoreReply::Int(next))
            }
            StoreCommand::Expire { key, ttl } => match self.live(&key) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Ok(StoreReply::Int(1))
                }
                None => Ok(StoreReply::Int(0)),
            },
            StoreCommand::Del(keys) => {
                let mut removed = 0;
                for key in keys {
                    if self.live(&key).is_some() {
                        self.entries.remove(&key);
                        removed += 1;
                    }
                }
                Ok(StoreReply::Int(removed))
            }
            StoreCommand::ZAdd { key, score, member } => {
                let added = if let Some(z) = self.zset(&key)? {
                    z.insert(member, score).is_none()
                } else {
                    let mut z = HashMap::new();
                    z.insert(member, score);
                    self.entries.insert(
                        key,
                        Entry {
                            data: Data::ZSet(z),
                            expires_at: None,
                        },
                    );
                    true
                };
                Ok(StoreReply::Int(i64::from(added)))
            }
            StoreCommand::ZRem { key, member } => {
                let removed = self
                    .zset(&key)?
                    .is_some_and(|z| z.remove(&member).is_some());
                self.drop_if_empty(&key);
                Ok(StoreReply::Int(i64::from(removed)))
            }
            StoreCommand::ZCard(key) => {
                let len = self.zset(&key)?.map_or(0, |z| z.len());
                Ok(StoreReply::Int(len as i64))
            }
            StoreCommand::LPush { key, value } => {
                let len = if let Some(l) = self.list(&key)? {
                    l.push_front(value);
                    l.len()
                } else {
                    self.entries.insert(
                        key,
                        Entry {
                            data: Data::List(VecDeque::from([value])),
                            expires_at: None,
                        },
                    );
                    1
                };
                Ok(StoreReply::Int(len as i64))
            }
            StoreCommand::LTrim { key, start, stop } => {
                if let Some(l) = self.list(&key)? {
                    match list_range(l.len(), start, stop) {
                        Some((from, to)) => {
                            l.truncate(to + 1);
                            l.drain(..from);
                        }
                        None => l.clear(),
                    }
                }
                self.drop_if_empty(&key);
                Ok(StoreReply::Text("OK".to_string()))
            }
            StoreCommand::LLen(key) => {
                let len = self.list(&key)?.map_or(0, |l| l.len());
                Ok(StoreReply::Int(len as i64))
            }
        }
    }
}

/// Resolve Redis-style inclusive list indices into `[from, to]`.
fn list_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn wrong_type(key: &str) -> AppError {
    AppError::Internal(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// In-process [`KeyValueStore`].
///
/// Batches run under a single lock, so [`KeyValueStore::exec`] is atomic with
/// respect to every other call. [`MemoryStore::set_available`] simulates an
/// outage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability. While unavailable every call fails with
    /// [`AppError::StoreUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        keys.iter().filter(|k| state.live(k).is_some()).count()
    }

    fn check(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    async fn apply(&self, command: StoreCommand) -> AppResult<StoreReply> {
        self.check()?;
        self.state.lock().await.apply(command)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn is_connected(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.apply(StoreCommand::Get(key.to_string())).await?.into_text())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.apply(StoreCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
        .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.apply(StoreCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl: Some(ttl),
        })?;
        Ok(true)
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        let reply = self.apply(StoreCommand::Incr(key.to_string())).await?;
        Ok(reply.as_int().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let reply = self
            .apply(StoreCommand::Expire {
                key: key.to_string(),
                ttl,
            })
            .await?;
        Ok(reply.as_int() == Some(1))
    }

    async fn del(&self, keys: &[String]) -> AppResult<u64> {
        let reply = self.apply(StoreCommand::Del(keys.to_vec())).await?;
        Ok(reply.as_int().unwrap_or_default() as u64)
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        self.check()?;
        Ok(self.state.lock().await.live(key).is_some())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> AppResult<()> {
        self.apply(StoreCommand::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> AppResult<Option<(String, f64)>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let first = state.sorted_members(key)?.into_iter().next();
        if let Some((member, _)) = &first {
            state.apply(StoreCommand::ZRem {
                key: key.to_string(),
                member: member.clone(),
            })?;
        }
        Ok(first)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> AppResult<Vec<String>> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state
            .sorted_members(key)?
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<u64> {
        let reply = self
            .apply(StoreCommand::ZRem {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?;
        Ok(reply.as_int().unwrap_or_default() as u64)
    }

    async fn zcard(&self, key: &str) -> AppResult<u64> {
        let reply = self.apply(StoreCommand::ZCard(key.to_string())).await?;
        Ok(reply.as_int().unwrap_or_default() as u64)
    }

    async fn lpush(&self, key: &str, value: &str) -> AppResult<u64> {
        let reply = self
            .apply(StoreCommand::LPush {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(reply.as_int().unwrap_or_default() as u64)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> AppResult<()> {
        self.apply(StoreCommand::LTrim {
            key: key.to_string(),
            start,
            stop,
        })
        .await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> AppResult<u64> {
        let reply = self.apply(StoreCommand::LLen(key.to_string())).await?;
        Ok(reply.as_int().unwrap_or_default() as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(list) = state.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match list_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn exec(&self, commands: Vec<StoreCommand>) -> AppResult<Vec<StoreReply>> {
        self.check()?;
        let mut state = self.state.lock().await;
        commands.into_iter().map(|c| state.apply(c)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_list_range() {
        assert_eq!(list_range(5, 0, -1), Some((0, 4)));
        assert_eq!(list_range(5, 0, 2), Some((0, 2)));
        assert_eq!(list_range(5, -2, -1), Some((3, 4)));
        assert_eq!(list_range(5, 3, 100), Some((3, 4)));
        assert_eq!(list_range(5, 4, 2), None);
        assert_eq!(list_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_set_nx_first_writer_wins() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_nx("k", "a", ttl).await.unwrap());
        assert!(!store.set_nx("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_keeps_expiry_and_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert!(store.expire("c", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zpopmin_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("z", -1.0, "b").await.unwrap();
        store.zadd("z", -5.0, "c").await.unwrap();
        store.zadd("z", -1.0, "a").await.unwrap();

        assert_eq!(store.zpopmin("z").await.unwrap().unwrap().0, "c");
        assert_eq!(store.zpopmin("z").await.unwrap().unwrap().0, "a");
        assert_eq!(store.zpopmin("z").await.unwrap().unwrap().0, "b");
        assert!(store.zpopmin("z").await.unwrap().is_none());
        assert_eq!(store.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_zrangebyscore_limit() {
        let store = MemoryStore::new();
        for (i, m) in ["a", "b", "c", "d"].iter().enumerate() {
            store.zadd("z", i as f64 * 10.0, m).await.unwrap();
        }

        let due = store.zrangebyscore("z", 0.0, 25.0, 10).await.unwrap();
        assert_eq!(due, vec!["a", "b", "c"]);

        let limited = store.zrangebyscore("z", 0.0, 100.0, 2).await.unwrap();
        assert_eq!(limited, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_bounded_list() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.lpush("l", &i.to_string()).await.unwrap();
            store.ltrim("l", 0, 2).await.unwrap();
        }

        assert_eq!(store.llen("l").await.unwrap(), 3);
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_exec_batch() {
        let store = MemoryStore::new();
        let replies = store
            .exec(vec![
                StoreCommand::Incr("n".into()),
                StoreCommand::Expire {
                    key: "n".into(),
                    ttl: Duration::from_secs(10),
                },
                StoreCommand::Get("other".into()),
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![StoreReply::Int(1), StoreReply::Int(1), StoreReply::Nil]
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("s", "v", None).await.unwrap();
        assert!(store.zadd("s", 1.0, "m").await.is_err());
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(!store.is_connected());
        assert!(matches!(
            store.get("k").await,
            Err(AppError::StoreUnavailable(_))
        ));
        assert!(store.exec(vec![StoreCommand::Incr("k".into())]).await.is_err());

        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
