//! Infrastructure layer - Storage adapters
//!
//! - `memory`: process-local stores (`dashmap`, `parking_lot`)
//! - `sqlite`: file-backed stores shared across worker processes

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryCoordinationStore, InMemoryRecordStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCoordinationStore, SqliteRecordStore};
