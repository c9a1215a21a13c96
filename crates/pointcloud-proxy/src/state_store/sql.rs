//! SeaORM-backed [`StateStore`] for SQLite and PostgreSQL.
//!
//! Statements are written once with `?` placeholders and renumbered for
//! PostgreSQL. Upserts use `ON CONFLICT`, which both backends support.

use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement, TransactionTrait, Value,
};
use std::sync::Arc;
use std::time::Duration;

use super::{StateStore, now_millis};
use crate::database::Database;
use crate::errors::StoreResult;

#[derive(Debug, Clone)]
pub struct SqlStateStore {
    connection: Arc<DatabaseConnection>,
    backend: DatabaseBackend,
}

impl SqlStateStore {
    pub fn new(database: Database) -> Self {
        Self {
            connection: database.connection(),
            backend: database.backend(),
        }
    }

    fn statement(&self, sql: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.backend, placeholders(self.backend, sql), values)
    }
}

/// Rewrite `?` placeholders as `$1, $2, ...` for PostgreSQL.
fn placeholders(backend: DatabaseBackend, sql: &str) -> String {
    if backend != DatabaseBackend::Postgres {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    for ch in sql.chars() {
        if ch == '?' {
            index += 1;
            out.push('$');
            out.push_str(&index.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as i64))
}

/// Escape `LIKE` wildcards so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row = self
            .connection
            .query_one(self.statement(
                "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
                vec![key.into(), now_millis().into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String>("", "value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.connection
            .execute(self.statement(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                vec![key.into(), value.into(), expires_at(ttl).into()],
            ))
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let txn = self.connection.begin().await?;
        txn.execute(self.statement(
            "DELETE FROM kv_entries WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
            vec![key.into(), now_millis().into()],
        ))
        .await?;
        let result = txn
            .execute(self.statement(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT (key) DO NOTHING",
                vec![key.into(), value.into(), expires_at(ttl).into()],
            ))
            .await?;
        txn.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = self
            .connection
            .execute(self.statement(
                "DELETE FROM kv_entries WHERE key = ?",
                vec![key.into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let result = self
            .connection
            .execute(self.statement(
                "DELETE FROM kv_entries WHERE key = ? AND value = ? \
                 AND (expires_at IS NULL OR expires_at > ?)",
                vec![key.into(), expected.into(), now_millis().into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let rows = self
            .connection
            .query_all(self.statement(
                "SELECT key FROM kv_entries WHERE key LIKE ? ESCAPE '\\' \
                 AND (expires_at IS NULL OR expires_at > ?) ORDER BY key",
                vec![like_prefix(prefix).into(), now_millis().into()],
            ))
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String>("", "key")?))
            .collect()
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let result = self
            .connection
            .execute(self.statement(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
                vec![now_millis().into()],
            ))
            .await?;
        Ok(result.rows_affected())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        self.connection
            .execute(self.statement(
                "INSERT INTO sorted_entries (set_name, member, score) VALUES (?, ?, ?) \
                 ON CONFLICT (set_name, member) DO UPDATE SET score = excluded.score",
                vec![set.into(), member.into(), score.into()],
            ))
            .await?;
        Ok(())
    }

    async fn zadd_existing(&self, set: &str, member: &str, score: f64) -> StoreResult<bool> {
        let result = self
            .connection
            .execute(self.statement(
                "UPDATE sorted_entries SET score = ? WHERE set_name = ? AND member = ?",
                vec![score.into(), set.into(), member.into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn zscore(&self, set: &str, member: &str) -> StoreResult<Option<f64>> {
        let row = self
            .connection
            .query_one(self.statement(
                "SELECT score FROM sorted_entries WHERE set_name = ? AND member = ?",
                vec![set.into(), member.into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<f64>("", "score")?)),
            None => Ok(None),
        }
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let statement = match limit {
            Some(limit) => self.statement(
                "SELECT member, score FROM sorted_entries WHERE set_name = ? \
                 ORDER BY score ASC, member ASC LIMIT ?",
                vec![set.into(), (limit as i64).into()],
            ),
            None => self.statement(
                "SELECT member, score FROM sorted_entries WHERE set_name = ? \
                 ORDER BY score ASC, member ASC",
                vec![set.into()],
            ),
        };
        let rows = self.connection.query_all(statement).await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String>("", "member")?,
                    row.try_get::<f64>("", "score")?,
                ))
            })
            .collect()
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        let result = self
            .connection
            .execute(self.statement(
                "DELETE FROM sorted_entries WHERE set_name = ? AND member = ?",
                vec![set.into(), member.into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn zcard(&self, set: &str) -> StoreResult<u64> {
        let row = self
            .connection
            .query_one(self.statement(
                "SELECT COUNT(*) AS member_count FROM sorted_entries WHERE set_name = ?",
                vec![set.into()],
            ))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64>("", "member_count")?.max(0) as u64),
            None => Ok(0),
        }
    }
}
