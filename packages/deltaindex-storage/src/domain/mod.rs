//! Domain layer: records, cutoff bounds and the two storage ports
//!
//! # Domain Models
//!
//! - `Record`: a row of some model with `updated_at` and the pending `delta` flag
//! - `CutoffBound`: the upper bound of a flag clear, inclusive or exclusive
//!
//! # Port Traits
//!
//! - `RecordStore`: the application database holding delta-flagged rows
//! - `CoordinationStore`: shared key-value service with TTLs and token locks
//!
//! Keys in the coordination store are flat strings. A "namespace" is a key
//! prefix followed by `:`; see [`namespaced`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// A row that participates in delta indexing.
///
/// `delta = true` means the row changed since the last base index build and
/// is only searchable through the delta index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub updated_at: DateTime<Utc>,
    pub delta: bool,
}

impl Record {
    /// A row that still waits for reconciliation into the base index.
    pub fn pending(id: i64, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            updated_at,
            delta: true,
        }
    }

    /// A row already covered by the base index.
    pub fn indexed(id: i64, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            updated_at,
            delta: false,
        }
    }
}

/// Upper bound for clearing `delta` flags.
///
/// A single index run clears up to and including the cutoff it captured.
/// A quorum clear stops strictly before the slowest partition's cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "bound", content = "at", rename_all = "snake_case")]
pub enum CutoffBound {
    /// `updated_at <= at`
    Inclusive(DateTime<Utc>),
    /// `updated_at < at`
    Exclusive(DateTime<Utc>),
}

impl CutoffBound {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CutoffBound::Inclusive(at) | CutoffBound::Exclusive(at) => *at,
        }
    }

    /// Whether a row last updated at `updated_at` falls under this bound.
    pub fn covers(&self, updated_at: DateTime<Utc>) -> bool {
        match self {
            CutoffBound::Inclusive(at) => updated_at <= *at,
            CutoffBound::Exclusive(at) => updated_at < *at,
        }
    }
}

/// Build `"{namespace}:{key}"`.
pub fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

// ═══════════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════════

/// Application database holding delta-flagged rows, grouped by model.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Newest `updated_at` among rows of `model` with `delta = true`.
    ///
    /// `None` when nothing is pending.
    async fn max_delta_updated_at(&self, model: &str) -> Result<Option<DateTime<Utc>>>;

    /// Set `delta = false` on every pending row of `model` covered by `bound`.
    ///
    /// Returns the number of rows changed. Rows outside the bound keep their
    /// flag even if they were pending.
    async fn clear_delta_flags(&self, model: &str, bound: CutoffBound) -> Result<u64>;
}

/// Shared key-value service reachable by every worker.
///
/// Expired entries behave exactly like absent ones for every operation.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store `value` under `key` only if no live entry exists.
    ///
    /// Returns `true` when this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditional write; `ttl = None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Returns `true` when a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every key under `namespace` (`"{namespace}:*"`).
    ///
    /// Idempotent; returns how many entries were removed.
    async fn flush(&self, namespace: &str) -> Result<usize>;

    /// Take the lock `key` for `token` until `ttl` elapses.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.set_if_absent(key, token, ttl).await
    }

    /// Release `key` only if it is still held by `token`.
    ///
    /// Returns `false` when the lock expired or belongs to someone else.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_inclusive_bound_covers_cutoff() {
        let bound = CutoffBound::Inclusive(at(100));
        assert!(bound.covers(at(99)));
        assert!(bound.covers(at(100)));
        assert!(!bound.covers(at(101)));
    }

    #[test]
    fn test_exclusive_bound_stops_before_cutoff() {
        let bound = CutoffBound::Exclusive(at(100));
        assert!(bound.covers(at(99)));
        assert!(!bound.covers(at(100)));
        assert_eq!(bound.timestamp(), at(100));
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced("incident_index", "p1"), "incident_index:p1");
    }

    #[test]
    fn test_record_constructors() {
        assert!(Record::pending(1, at(5)).delta);
        assert!(!Record::indexed(1, at(5)).delta);
    }
}
