use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_millis, open, open_in_memory, to_millis, validate_identifier, SharedConnection};
use crate::domain::{CutoffBound, Record, RecordStore};
use crate::Result;

/// One table per model: `(id INTEGER PRIMARY KEY, updated_at INTEGER, delta INTEGER)`.
///
/// `ensure_model`, `upsert` and `get` are synchronous seeding and inspection
/// helpers; the [`RecordStore`] methods run on the blocking pool.
pub struct SqliteRecordStore {
    conn: SharedConnection,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::new(open(path)?),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::new(open_in_memory()?),
        })
    }

    /// Create the table for `model` if it does not exist yet.
    pub fn ensure_model(&self, model: &str) -> Result<()> {
        validate_identifier(model)?;
        let conn = self.conn.lock();
        create_table(&conn, model)
    }

    pub fn upsert(&self, model: &str, record: &Record) -> Result<()> {
        validate_identifier(model)?;
        let conn = self.conn.lock();
        create_table(&conn, model)?;
        conn.execute(
            &format!(
                "INSERT INTO \"{model}\" (id, updated_at, delta) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at, delta = excluded.delta"
            ),
            params![record.id, to_millis(record.updated_at), record.delta],
        )?;
        Ok(())
    }

    pub fn get(&self, model: &str, id: i64) -> Result<Option<Record>> {
        validate_identifier(model)?;
        let conn = self.conn.lock();
        create_table(&conn, model)?;
        let row = conn
            .query_row(
                &format!("SELECT id, updated_at, delta FROM \"{model}\" WHERE id = ?1"),
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, updated_at, delta)| {
            Ok(Record {
                id,
                updated_at: from_millis(updated_at)?,
                delta,
            })
        })
        .transpose()
    }
}

fn create_table(conn: &Connection, model: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{model}\" (
             id INTEGER PRIMARY KEY,
             updated_at INTEGER NOT NULL,
             delta INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS \"{model}_delta_updated_at\" ON \"{model}\" (delta, updated_at);"
    ))?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn max_delta_updated_at(&self, model: &str) -> Result<Option<DateTime<Utc>>> {
        validate_identifier(model)?;
        let model = model.to_string();
        self.conn
            .run(move |conn| {
                create_table(conn, &model)?;
                let max: Option<i64> = conn.query_row(
                    &format!("SELECT MAX(updated_at) FROM \"{model}\" WHERE delta = 1"),
                    [],
                    |row| row.get(0),
                )?;
                max.map(from_millis).transpose()
            })
            .await
    }

    async fn clear_delta_flags(&self, model: &str, bound: CutoffBound) -> Result<u64> {
        validate_identifier(model)?;
        let model = model.to_string();
        let op = match bound {
            CutoffBound::Inclusive(_) => "<=",
            CutoffBound::Exclusive(_) => "<",
        };
        self.conn
            .run(move |conn| {
                create_table(conn, &model)?;
                let changed = conn.execute(
                    &format!(
                        "UPDATE \"{model}\" SET delta = 0 WHERE delta = 1 AND updated_at {op} ?1"
                    ),
                    params![to_millis(bound.timestamp())],
                )?;
                Ok(changed as u64)
            })
            .await
    }
}
