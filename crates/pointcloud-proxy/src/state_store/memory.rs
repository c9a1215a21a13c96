//! Process-local [`StateStore`] backed by tokio locks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::StateStore;
use crate::errors::StoreResult;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: RwLock<HashMap<String, Entry>>,
    sets: RwLock<HashMap<String, HashMap<String, f64>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.values.write().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut values = self.values.write().await;
        if values.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .values
            .write()
            .await
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut values = self.values.write().await;
        let matches = values
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            values.remove(key);
        }
        Ok(matches)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let values = self.values.read().await;
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = Instant::now();
        let mut values = self.values.write().await;
        let before = values.len();
        values.retain(|_, entry| entry.is_live(now));
        Ok((before - values.len()) as u64)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        self.sets
            .write()
            .await
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zadd_existing(&self, set: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut sets = self.sets.write().await;
        match sets.get_mut(set).and_then(|members| members.get_mut(member)) {
            Some(existing) => {
                *existing = score;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zscore(&self, set: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self
            .sets
            .read()
            .await
            .get(set)
            .and_then(|members| members.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let sets = self.sets.read().await;
        let Some(members) = sets.get(set) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(String, f64)> = members
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(limit) = limit {
            ordered.truncate(limit);
        }
        Ok(ordered)
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut sets = self.sets.write().await;
        let removed = sets
            .get_mut(set)
            .is_some_and(|members| members.remove(member).is_some());
        if sets.get(set).is_some_and(|members| members.is_empty()) {
            sets.remove(set);
        }
        Ok(removed)
    }

    async fn zcard(&self, set: &str) -> StoreResult<u64> {
        Ok(self
            .sets
            .read()
            .await
            .get(set)
            .map(|members| members.len() as u64)
            .unwrap_or(0))
    }
}
