//! Delta job execution
//!
//! [`DeltaWorker::perform`] runs one job end to end:
//!
//! ```text
//! suspended? ─yes─▶ Skipped(Suspended)
//!     │no
//! rotating? ──yes─▶ Skipped(AlreadyRotating)
//!     │no
//! lock ───busy───▶ enqueue after delay ─▶ Requeued
//!     │held
//! prune queued duplicates → inspect → plan → run
//!     │
//! sharded + cutoff? ─▶ quorum record_and_check
//!     │
//! release lock ─▶ Completed(report)
//! ```
//!
//! [`WorkerPool`] drives `perform` from a queue with bounded concurrency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deltaindex_storage::{CoordinationStore, RecordStore};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeltaConfig;
use crate::detector::{ProcessTableDetector, RunDetector};
use crate::error::{ReindexError, Result};
use crate::indexer::Indexer;
use crate::job::{IndexJob, ReindexDecision};
#[cfg(feature = "metrics")]
use crate::metrics::WorkerMetrics;
use crate::lock::LockGuard;
use crate::planner::{ActionPlanner, IndexState};
use crate::queue::JobQueue;
use crate::quorum::QuorumTracker;
use crate::runner::{IndexRunner, RunReport};
use crate::suspend::SuspendSwitch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRotating,
    Suspended,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Skipped(SkipReason),
    /// Lock was busy; the job is back on the queue
    Requeued,
    Completed(RunReport),
}

/// Process exit status for a job that must be retried later (`EX_TEMPFAIL`).
pub const RETRY_EXIT_STATUS: u8 = 75;

impl WorkerOutcome {
    /// Exit status of a one-shot run. A requeue onto a process-local queue
    /// dies with the process, so the caller's scheduler has to retry.
    pub fn exit_status(&self) -> u8 {
        match self {
            WorkerOutcome::Requeued => RETRY_EXIT_STATUS,
            WorkerOutcome::Skipped(_) | WorkerOutcome::Completed(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerOutcome::Skipped(SkipReason::AlreadyRotating) => "skipped_rotating",
            WorkerOutcome::Skipped(SkipReason::Suspended) => "skipped_suspended",
            WorkerOutcome::Requeued => "requeued",
            WorkerOutcome::Completed(_) => "completed",
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            WorkerOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Dry-run view of what `perform` would do right now.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRun {
    pub index: String,
    pub base_index: String,
    pub model: String,
    pub sharded: bool,
    pub state: IndexState,
    pub decision: ReindexDecision,
}

pub struct DeltaWorker {
    config: Arc<DeltaConfig>,
    queue: Arc<dyn JobQueue>,
    detector: Arc<dyn RunDetector>,
    lock: LockGuard,
    suspend: SuspendSwitch,
    planner: ActionPlanner,
    runner: IndexRunner,
    quorum: QuorumTracker,
    #[cfg(feature = "metrics")]
    metrics: Option<WorkerMetrics>,
}

impl DeltaWorker {
    pub fn new(
        config: Arc<DeltaConfig>,
        coordination: Arc<dyn CoordinationStore>,
        records: Arc<dyn RecordStore>,
        indexer: Arc<dyn Indexer>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let verbose = !config.indexer.quiet_deltas;
        Self {
            queue,
            detector: Arc::new(ProcessTableDetector::default()),
            lock: LockGuard::new(coordination.clone(), config.lock_timeout()),
            suspend: SuspendSwitch::new(coordination.clone()),
            planner: ActionPlanner::new(config.merge_threshold()),
            runner: IndexRunner::new(indexer, records.clone(), verbose),
            quorum: QuorumTracker::new(coordination, records, config.sharded.clone()),
            config,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn RunDetector>) -> Self {
        self.detector = detector;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn suspend_switch(&self) -> &SuspendSwitch {
        &self.suspend
    }

    pub fn job(&self, index: &str) -> Result<IndexJob> {
        IndexJob::new(index, &self.config)
    }

    /// Decide without locking or building.
    pub fn plan(&self, index: &str) -> Result<PlannedRun> {
        let job = self.job(index)?;
        let state = IndexState::inspect(&job);
        Ok(PlannedRun {
            decision: self.planner.plan(&state),
            index: job.index,
            base_index: job.base_index,
            model: job.model,
            sharded: job.sharded,
            state,
        })
    }

    pub async fn perform(&self, index: &str) -> Result<WorkerOutcome> {
        let result = self.perform_inner(index).await;
        self.observe(&result);
        result
    }

    #[cfg(feature = "metrics")]
    fn observe(&self, result: &Result<WorkerOutcome>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match result {
            Ok(outcome) => {
                metrics.observe(outcome.kind());
                if let Some(report) = outcome.report() {
                    metrics
                        .run_seconds
                        .observe(report.duration_ms as f64 / 1000.0);
                    if report.quorum.as_ref().map_or(false, |q| q.is_triggered()) {
                        metrics.quorum_triggers.inc();
                    }
                }
            }
            Err(_) => metrics.observe("failed"),
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe(&self, _result: &Result<WorkerOutcome>) {}

    async fn perform_inner(&self, index: &str) -> Result<WorkerOutcome> {
        let job = self.job(index)?;

        if self.suspend.is_suspended(index).await? {
            info!(index = %index, "skipped: delta processing suspended");
            return Ok(WorkerOutcome::Skipped(SkipReason::Suspended));
        }

        if self.detector.is_rotating(index).await? {
            info!(index = %index, "skipped: indexer already rotating this index");
            return Ok(WorkerOutcome::Skipped(SkipReason::AlreadyRotating));
        }

        let lease = match self.lock.acquire(index).await {
            Ok(lease) => lease,
            Err(ReindexError::LockBusy(_)) => {
                let delay = self.config.worker.requeue_delay();
                self.queue.enqueue_after(index, delay).await?;
                info!(index = %index, delay_ms = delay.as_millis() as u64, "lock busy, job requeued");
                return Ok(WorkerOutcome::Requeued);
            }
            Err(e) => return Err(e),
        };

        let result = self.perform_locked(&job).await;
        let released = lease.release().await;
        let report = result?;
        released?;

        Ok(WorkerOutcome::Completed(report))
    }

    async fn perform_locked(&self, job: &IndexJob) -> Result<RunReport> {
        let removed = self.queue.remove_pending(&job.index).await?;
        if removed > 0 {
            debug!(index = %job.index, removed, "dropped queued duplicates");
        }

        let state = IndexState::inspect(job);
        let decision = self.planner.plan(&state);
        info!(
            index = %job.index,
            decision = %decision,
            marker = state.marker_present,
            base_present = state.base_index_present,
            "running delta job"
        );

        let mut report = match self.runner.run(decision, job).await {
            Ok(report) => report,
            Err(e) => {
                if let ReindexError::BuildFailed {
                    index,
                    decision,
                    status,
                    output,
                } = &e
                {
                    error!(
                        index = %index,
                        decision = %decision,
                        status = %status,
                        output = %output.trim_end(),
                        "indexer run failed"
                    );
                } else {
                    error!(index = %job.index, decision = %decision, error = %e, "delta job failed");
                }
                return Err(e);
            }
        };

        if job.sharded {
            if let Some(cutoff) = report.cutoff {
                report.quorum = Some(
                    self.quorum
                        .record_and_check(job.partition_key(), cutoff)
                        .await?,
                );
            }
        }

        info!(
            index = %job.index,
            decision = %decision,
            rows_cleared = report.rows_cleared,
            duration_ms = report.duration_ms,
            "delta job completed"
        );
        Ok(report)
    }
}

/// Counters for one [`WorkerPool::run`].
#[derive(Debug, Default)]
pub struct PoolStats {
    pub completed: AtomicU64,
    pub skipped: AtomicU64,
    pub requeued: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub completed: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub failed: u64,
}

impl PoolStats {
    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    worker: Arc<DeltaWorker>,
    concurrency: usize,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(worker: Arc<DeltaWorker>) -> Self {
        let concurrency = worker.config().worker.concurrency.max(1);
        Self::with_concurrency(worker, concurrency)
    }

    pub fn with_concurrency(worker: Arc<DeltaWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> PoolSummary {
        self.stats.summary()
    }

    /// Pull jobs from the worker's queue until `cancel` fires, then wait for
    /// in-flight jobs. Failed jobs are enqueued again after
    /// `worker.requeue_delay_ms` unless the error is permanent.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PoolSummary> {
        let queue = self.worker.queue().clone();
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!(concurrency = self.concurrency, "worker pool started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "delta job task panicked");
                    }
                }
                job = queue.dequeue(), if tasks.len() < self.concurrency => {
                    let index = job?;
                    let worker = self.worker.clone();
                    let stats = self.stats.clone();
                    tasks.spawn(async move {
                        Self::settle(&worker, &stats, &index).await;
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "delta job task panicked");
            }
        }

        let summary = self.stats.summary();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            requeued = summary.requeued,
            failed = summary.failed,
            "worker pool stopped"
        );
        Ok(summary)
    }

    async fn settle(worker: &DeltaWorker, stats: &PoolStats, index: &str) {
        match worker.perform(index).await {
            Ok(WorkerOutcome::Completed(_)) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(WorkerOutcome::Skipped(_)) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(WorkerOutcome::Requeued) => {
                stats.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                let category = e.category();
                if !category.should_requeue() {
                    error!(index = %index, category = %category, error = %e, "dropping job");
                    return;
                }
                let delay = worker.config().worker.requeue_delay();
                if let Err(requeue) = worker.queue().enqueue_after(index, delay).await {
                    error!(index = %index, error = %requeue, "could not requeue failed job");
                } else {
                    warn!(index = %index, category = %category, "failed job requeued");
                }
            }
        }
    }
}
