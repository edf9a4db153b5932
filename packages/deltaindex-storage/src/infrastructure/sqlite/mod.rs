//! SQLite adapters
//!
//! Both stores wrap a single `rusqlite::Connection` behind a mutex. Every
//! worker process on a host opens the same database file; cross-process
//! atomicity comes from `BEGIN IMMEDIATE` transactions and the busy timeout.
//! Trait methods run their statements on tokio's blocking pool, since a busy
//! file can hold a call for the whole busy timeout.
//!
//! Timestamps are stored as Unix milliseconds so range comparisons stay
//! numeric.

mod coordination;
mod records;

pub use coordination::SqliteCoordinationStore;
pub use records::SqliteRecordStore;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::{Result, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(conn)
}

fn open_in_memory() -> Result<Connection> {
    Ok(Connection::open_in_memory()?)
}

#[derive(Clone)]
struct SharedConnection(Arc<Mutex<Connection>>);

impl SharedConnection {
    fn new(conn: Connection) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    /// Lock on the calling thread.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.0.lock()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.0.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = shared.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StorageError::unavailable(format!("SQLite task did not complete: {}", e)).with_source(e)
        })?
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::serialization(format!("timestamp out of range: {}", ms)))
}

/// Accept only `[A-Za-z_][A-Za-z0-9_]*` so model names can be spliced into SQL.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_identifier(name))
    }
}
