//! Shared key/value and sorted-set store.
//!
//! Every piece of cross-request state (cache metadata, the recency index,
//! job records, the dedup registry, last-known progress) lives behind
//! [`StateStore`] so that several service instances can share one store.
//! Claims are made with [`StateStore::set_if_absent`], which is atomic in
//! every backend.

pub mod memory;
pub mod sql;

pub use memory::MemoryStateStore;
pub use sql::SqlStateStore;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::errors::StoreResult;

#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Insert or overwrite a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Insert only if no live value exists. Returns whether this call won.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete only while the stored value still equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Drop expired keys. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<u64>;

    /// Insert a member or update its score.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Update the score of an existing member only. Returns whether it existed.
    async fn zadd_existing(&self, set: &str, member: &str, score: f64) -> StoreResult<bool>;

    async fn zscore(&self, set: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members ordered by ascending score, ties broken by member.
    async fn zrange_by_score(
        &self,
        set: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool>;

    async fn zcard(&self, set: &str) -> StoreResult<u64>;
}

/// Read and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

/// Build the store named by the configuration.
///
/// `memory://` gives a process-local store; any other URL is opened with
/// SeaORM and migrated.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    if config.url.starts_with("memory:") {
        info!("Using in-memory state store");
        return Ok(Arc::new(MemoryStateStore::new()));
    }

    let database = Database::new(config).await?;
    database.migrate().await?;
    Ok(Arc::new(SqlStateStore::new(database)))
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
