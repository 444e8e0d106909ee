use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    Any, AnyPool, Connection, Transaction,
    any::{AnyPoolOptions, install_default_drivers},
};

use crate::error::KeeperError;
use crate::keeper::{Admission, Key, Keeper, Stats};

pub const DEFAULT_TABLE: &str = "api_keys";

/// Open a pool for any URL supported by the compiled-in drivers
/// (`postgres://`, `sqlite:`).
pub async fn connect(database_url: &str, max_connections: u32) -> Result<AnyPool, sqlx::Error> {
    install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

struct Queries {
    create_table: String,
    select: String,
    consume: String,
    upsert: String,
}

impl Queries {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    api_key TEXT PRIMARY KEY,
                    api_limit BIGINT NOT NULL,
                    api_usage BIGINT NOT NULL DEFAULT 0
                )
                "#
            ),
            select: format!("SELECT api_limit, api_usage FROM {table} WHERE api_key = $1"),
            // The usage guard is re-evaluated against the latest row version once
            // the row lock is obtained, so a concurrent exhaust cannot be overrun.
            // On SQLite `RETURNING` needs 3.35 or newer.
            consume: format!(
                r#"
                UPDATE {table}
                SET api_usage = api_usage + 1
                WHERE api_key = $1 AND api_usage < api_limit
                RETURNING api_limit, api_usage
                "#
            ),
            upsert: format!(
                r#"
                INSERT INTO {table} (api_key, api_limit, api_usage)
                VALUES ($1, $2, 0)
                ON CONFLICT (api_key) DO UPDATE
                SET api_limit = excluded.api_limit, api_usage = 0
                "#
            ),
        }
    }
}

/// Keeper backed by a single relational table.
///
/// Each row holds `(api_key, api_limit, api_usage)`; `remaining` is always
/// derived as `api_limit - api_usage`.
pub struct SqlStore {
    pool: AnyPool,
    table: String,
    timeout: Option<Duration>,
    queries: Queries,
}

impl SqlStore {
    pub fn new(pool: AnyPool, table: impl Into<String>) -> Result<Self, KeeperError> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(KeeperError::InvalidTable(table));
        }
        let queries = Queries::for_table(&table);
        Ok(Self {
            pool,
            table,
            timeout: None,
            queries,
        })
    }

    /// Bound every keeper operation by `timeout`. An `allow` that expires before
    /// its commit is sent rolls back and reports [`KeeperError::Timeout`]; the
    /// commit itself always runs to completion.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Ensures the database is reachable and the quota table exists.
    pub async fn check(&self) -> Result<(), KeeperError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeeperError::Database { op: "access database", source: e })?;
        conn.ping()
            .await
            .map_err(|e| KeeperError::Database { op: "access database", source: e })?;

        sqlx::query(&self.queries.create_table)
            .execute(&mut *conn)
            .await
            .map_err(|e| KeeperError::Database { op: "create table", source: e })?;

        tracing::info!(table = %self.table, "quota table ready");
        Ok(())
    }

    /// Provision `key` with `limit` and zero usage, overwriting any prior row.
    pub async fn set(&self, key: impl Into<Key>, limit: u32) -> Result<(), KeeperError> {
        let key = key.into();
        sqlx::query(&self.queries.upsert)
            .bind(key.as_str())
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await
            .map_err(|e| KeeperError::storage("provision key", key.as_str(), e))?;

        tracing::debug!(key = %key, limit, "provisioned key");
        Ok(())
    }

    async fn deadline<T, F>(&self, op: &'static str, key: &Key, fut: F) -> Result<T, KeeperError>
    where
        F: Future<Output = Result<T, KeeperError>>,
    {
        let Some(after) = self.timeout else {
            return fut.await;
        };

        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(key = %key, op, ?after, "keeper operation timed out");
                Err(KeeperError::Timeout {
                    op,
                    key: key.to_string(),
                    after,
                })
            }
        }
    }

    /// Everything in `allow` up to, but excluding, the commit. Dropping this
    /// future drops the transaction, which rolls it back.
    async fn consume(&self, key: &Key) -> Result<Consumed, KeeperError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeeperError::storage("begin transaction", key.as_str(), e))?;

        // Writing first takes the write lock up front; on SQLite a read lock
        // upgraded later can fail with `database is locked` instead of waiting.
        let updated = sqlx::query_as::<_, (i64, i64)>(&self.queries.consume)
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await;
        match updated {
            Ok(Some((limit, usage))) => {
                return Ok(Consumed::Granted(tx, derive_stats(limit, usage)));
            }
            Ok(None) => {}
            Err(e) => {
                let cause = KeeperError::storage("update API usage", key.as_str(), e);
                return Err(rollback(tx, cause).await);
            }
        }

        // Nothing was updated: the key is either exhausted or unknown.
        let row = sqlx::query_as::<_, (i64, i64)>(&self.queries.select)
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await;
        match row {
            Ok(Some((limit, _))) => {
                let stats = Stats {
                    remaining: 0,
                    limit,
                };
                close(tx, key).await?;
                tracing::debug!(key = %key, limit, "limit reached");
                Ok(Consumed::Denied(stats))
            }
            Ok(None) => {
                tracing::warn!(key = %key, "unknown API key");
                Err(rollback(tx, KeeperError::UnknownKey).await)
            }
            Err(e) => {
                let cause = KeeperError::storage("get data", key.as_str(), e);
                Err(rollback(tx, cause).await)
            }
        }
    }

    async fn try_stats(&self, key: &Key) -> Result<Stats, KeeperError> {
        let row = sqlx::query_as::<_, (i64, i64)>(&self.queries.select)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KeeperError::storage("get data", key.as_str(), e))?;

        match row {
            Some((limit, usage)) => Ok(derive_stats(limit, usage)),
            None => Err(KeeperError::UnknownKey),
        }
    }
}

enum Consumed {
    /// Usage was incremented inside the still-open transaction.
    Granted(Transaction<'static, Any>, Stats),
    Denied(Stats),
}

#[async_trait]
impl Keeper for SqlStore {
    async fn allow(&self, key: &Key) -> Result<Admission, KeeperError> {
        let (tx, stats) = match self.deadline("allow", key, self.consume(key)).await? {
            Consumed::Granted(tx, stats) => (tx, stats),
            Consumed::Denied(stats) => return Ok(Admission::Denied(stats)),
        };

        // The commit is never cut short by the deadline: once it is sent the
        // caller must learn whether the decrement landed.
        //
        // `commit` consumes the transaction, so a failed commit cannot be rolled
        // back here; sqlx rolls the still-open transaction back when the
        // connection is released, before the connection is reused.
        tx.commit()
            .await
            .map_err(|e| KeeperError::storage("commit transaction", key.as_str(), e))?;

        tracing::debug!(key = %key, remaining = stats.remaining, limit = stats.limit, "call admitted");
        Ok(Admission::Granted(stats))
    }

    async fn stats(&self, key: &Key) -> Result<Stats, KeeperError> {
        self.deadline("stats", key, self.try_stats(key)).await
    }
}

// Denials mutate nothing, but the transaction is still closed explicitly.
async fn close(tx: Transaction<'_, Any>, key: &Key) -> Result<(), KeeperError> {
    tx.rollback()
        .await
        .map_err(|e| KeeperError::storage("close transaction", key.as_str(), e))
}

async fn rollback(tx: Transaction<'_, Any>, cause: KeeperError) -> KeeperError {
    match tx.rollback().await {
        Ok(()) => cause,
        Err(source) => {
            tracing::error!(error = %source, cause = %cause, "rollback failed");
            KeeperError::Rollback {
                cause: Box::new(cause),
                source,
            }
        }
    }
}

fn derive_stats(limit: i64, usage: i64) -> Stats {
    Stats {
        remaining: (limit - usage).clamp(0, limit.max(0)),
        limit,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
