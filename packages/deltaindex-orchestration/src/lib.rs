/*
 * Deltaindex Orchestration - Delta Reindex Coordination
 *
 * Keeps full-text indices in sync with delta-flagged database rows.
 *
 * Architecture:
 * - Per-index lock with TTL (coordination store)
 * - Run detector for rotations started outside the lock
 * - Action planner (delta only / merge / full rebuild)
 * - Index runner with pre-build cutoff capture
 * - Quorum tracker for sharded index families
 * - Worker + pool (queue driven, delayed requeue on busy)
 */

// Public modules
pub mod config;
pub mod detector;
pub mod error;
pub mod indexer;
pub mod job;
pub mod lock;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod planner;
pub mod queue;
pub mod quorum;
pub mod runner;
pub mod suspend;
pub mod worker;

// Re-exports
pub use config::{DeltaConfig, IndexerConfig, ShardedConfig, WorkerConfig};
pub use detector::{NoopDetector, ProcessTableDetector, RunDetector};
pub use error::{ErrorCategory, ReindexError, Result};
pub use indexer::{CommandIndexer, Indexer, IndexerOutput};
pub use job::{IndexJob, ReindexDecision};
pub use lock::{Lease, LockGuard, Semaphore};
#[cfg(feature = "metrics")]
pub use metrics::WorkerMetrics;
pub use planner::{ActionPlanner, IndexState};
pub use queue::{InMemoryJobQueue, JobQueue};
pub use quorum::{QuorumOutcome, QuorumTracker};
pub use runner::{IndexRunner, RunReport};
pub use suspend::SuspendSwitch;
pub use worker::{
    DeltaWorker, PlannedRun, PoolSummary, SkipReason, WorkerOutcome, WorkerPool,
    RETRY_EXIT_STATUS,
};
