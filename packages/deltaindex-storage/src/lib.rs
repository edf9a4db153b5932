//! deltaindex-storage - persistence ports for delta index coordination
//!
//! Two external collaborators are modelled here:
//!
//! 1. **Record store**: rows carrying an `updated_at` timestamp and a boolean
//!    `delta` flag. The coordinator only ever reads the newest pending row and
//!    clears flags up to a cutoff.
//! 2. **Coordination store**: a shared key-value service with TTLs, used for
//!    per-index locks, the quorum semaphore and partition completion sets.
//!
//! ## Adapters
//!
//! - In-memory (`dashmap` / `parking_lot`): single process, used by tests and
//!   embedded workers
//! - SQLite (`rusqlite`, feature `sqlite`): one database file shared by every
//!   worker process on the host
//!
//! ## Usage
//!
//! ```rust,ignore
//! use deltaindex_storage::{CoordinationStore, CutoffBound, InMemoryCoordinationStore, RecordStore};
//!
//! let cutoff = records.max_delta_updated_at("articles").await?;
//! if let Some(ts) = cutoff {
//!     records.clear_delta_flags("articles", CutoffBound::Inclusive(ts)).await?;
//! }
//!
//! let fresh = coordination.set_if_absent("incident_index:p1", "…", ttl).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{namespaced, CoordinationStore, CutoffBound, Record, RecordStore};
pub use infrastructure::{InMemoryCoordinationStore, InMemoryRecordStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteCoordinationStore, SqliteRecordStore};
