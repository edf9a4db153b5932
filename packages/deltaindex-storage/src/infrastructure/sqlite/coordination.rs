use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{open, open_in_memory, SharedConnection};
use crate::domain::CoordinationStore;
use crate::Result;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS coordination_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);";

/// Key-value coordination over a shared SQLite file.
///
/// `expires_at` is wall-clock Unix milliseconds; `NULL` never expires.
pub struct SqliteCoordinationStore {
    conn: SharedConnection,
}

impl SqliteCoordinationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(open(path)?)
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: SharedConnection::new(conn),
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn prefix_len(prefix: &str) -> i64 {
    i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX)
}

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM coordination_kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![key, now_ms()],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO coordination_kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, value, expiry(Some(ttl))],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO coordination_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                    params![key, value, expiry(ttl)],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.conn
            .run(move |conn| {
                let value = conn
                    .query_row(
                        &format!("SELECT value FROM coordination_kv WHERE key = ? AND {LIVE}"),
                        params![key, now_ms()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.conn
            .run(move |conn| {
                let removed = conn.execute(
                    &format!("DELETE FROM coordination_kv WHERE key = ? AND {LIVE}"),
                    params![key, now_ms()],
                )?;
                // drop a lingering expired row too
                conn.execute("DELETE FROM coordination_kv WHERE key = ?1", params![key])?;
                Ok(removed == 1)
            })
            .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.conn
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key FROM coordination_kv WHERE substr(key, 1, ?) = ? AND {LIVE} ORDER BY key"
                ))?;
                let keys = stmt
                    .query_map(params![prefix_len(&prefix), prefix, now_ms()], |row| {
                        row.get(0)
                    })?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
    }

    async fn flush(&self, namespace: &str) -> Result<usize> {
        let prefix = format!("{}:", namespace);
        self.conn
            .run(move |conn| {
                let len = prefix_len(&prefix);
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let live = tx.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM coordination_kv WHERE substr(key, 1, ?) = ? AND {LIVE}"
                    ),
                    params![len, prefix, now_ms()],
                    |row| row.get::<_, i64>(0),
                )?;
                tx.execute(
                    "DELETE FROM coordination_kv WHERE substr(key, 1, ?1) = ?2",
                    params![len, prefix],
                )?;
                tx.commit()?;
                Ok(usize::try_from(live).unwrap_or_default())
            })
            .await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let (key, token) = (key.to_string(), token.to_string());
        self.conn
            .run(move |conn| {
                let removed = conn.execute(
                    &format!("DELETE FROM coordination_kv WHERE key = ? AND value = ? AND {LIVE}"),
                    params![key, token, now_ms()],
                )?;
                Ok(removed == 1)
            })
            .await
    }
}
