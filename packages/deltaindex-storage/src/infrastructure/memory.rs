//! In-memory adapters
//!
//! TTLs are measured with `tokio::time::Instant`, so tests can drive expiry
//! with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::domain::{CoordinationStore, CutoffBound, Record, RecordStore};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Record store
// ═══════════════════════════════════════════════════════════════════════════

/// Rows grouped by model, keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    models: RwLock<HashMap<String, BTreeMap<i64, Record>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, model: &str, record: Record) {
        self.models
            .write()
            .entry(model.to_string())
            .or_default()
            .insert(record.id, record);
    }

    /// Mark a row as changed at `at` (what an application save does).
    pub fn touch(&self, model: &str, id: i64, at: DateTime<Utc>) {
        self.upsert(model, Record::pending(id, at));
    }

    pub fn get(&self, model: &str, id: i64) -> Option<Record> {
        self.models
            .read()
            .get(model)
            .and_then(|rows| rows.get(&id).cloned())
    }

    /// Ids of rows still flagged `delta = true`, ascending.
    pub fn pending_ids(&self, model: &str) -> Vec<i64> {
        self.models
            .read()
            .get(model)
            .map(|rows| {
                rows.values()
                    .filter(|record| record.delta)
                    .map(|record| record.id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn max_delta_updated_at(&self, model: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.models.read().get(model).and_then(|rows| {
            rows.values()
                .filter(|record| record.delta)
                .map(|record| record.updated_at)
                .max()
        }))
    }

    async fn clear_delta_flags(&self, model: &str, bound: CutoffBound) -> Result<u64> {
        let mut models = self.models.write();
        let Some(rows) = models.get_mut(model) else {
            return Ok(0);
        };

        let mut cleared = 0;
        for record in rows.values_mut() {
            if record.delta && bound.covers(record.updated_at) {
                record.delta = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordination store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local coordination store.
///
/// Workers sharing one `Arc<InMemoryCoordinationStore>` see the same locks
/// and completion sets. Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (diagnostics only).
    pub fn live_len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(Entry::new(value, Some(ttl)));
                    Ok(true)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));

        match live {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self, namespace: &str) -> Result<usize> {
        let prefix = format!("{}:", namespace);
        let now = Instant::now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.value == token && entry.is_live(now))
            .is_some())
    }
}
