#![allow(dead_code)]

use gatekeeper::SqlStore;
use sqlx::{
    AnyPool, Executor,
    any::{AnyPoolOptions, install_default_drivers},
};
use tempfile::TempDir;

pub const TABLE: &str = "keys";

/// A single-connection in-memory SQLite pool. Every SQLite `:memory:`
/// connection is its own database, so the one connection must never be
/// recycled.
pub async fn memory_pool() -> AnyPool {
    install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite")
}

/// A checked store over a fresh database.
pub async fn sql_store() -> SqlStore {
    let store = SqlStore::new(memory_pool().await, TABLE).expect("valid table name");
    store.check().await.expect("schema bootstrap");
    store
}

/// A file-backed SQLite pool with several connections, so concurrent calls
/// contend on the engine's own locks. Rollback-journal mode makes a commit
/// wait for open readers.
pub async fn file_pool(dir: &TempDir, max_connections: u32) -> AnyPool {
    install_default_drivers();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("quota.db").display());
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("PRAGMA journal_mode = DELETE").await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("open file-backed sqlite")
}

pub async fn file_store(dir: &TempDir, max_connections: u32) -> SqlStore {
    let store = SqlStore::new(file_pool(dir, max_connections).await, TABLE).expect("valid table name");
    store.check().await.expect("schema bootstrap");
    store
}

/// Insert a raw row, bypassing provisioning.
pub async fn insert_row(store: &SqlStore, key: &str, limit: i64, usage: i64) {
    sqlx::query(&format!(
        "INSERT INTO {} (api_key, api_limit, api_usage) VALUES ($1, $2, $3)",
        store.table()
    ))
    .bind(key)
    .bind(limit)
    .bind(usage)
    .execute(store.pool())
    .await
    .expect("insert row");
}

pub async fn usage_of(store: &SqlStore, key: &str) -> i64 {
    let (usage,): (i64,) = sqlx::query_as(&format!(
        "SELECT api_usage FROM {} WHERE api_key = $1",
        store.table()
    ))
    .bind(key)
    .fetch_one(store.pool())
    .await
    .expect("read usage");
    usage
}
