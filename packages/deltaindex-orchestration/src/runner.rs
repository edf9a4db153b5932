use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use deltaindex_storage::{CutoffBound, RecordStore};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ReindexError, Result};
use crate::indexer::{Indexer, IndexerOutput};
use crate::job::{IndexJob, ReindexDecision};
use crate::quorum::QuorumOutcome;

/// What one run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub index: String,
    pub decision: Option<ReindexDecision>,
    /// Newest pending `updated_at` captured before the build
    pub cutoff: Option<DateTime<Utc>>,
    pub rows_cleared: u64,
    pub marker_cleared: bool,
    pub duration_ms: u64,
    pub indexer_output: Vec<String>,
    /// Set for sharded partitions that recorded completion
    pub quorum: Option<QuorumOutcome>,
}

/// Executes a planned decision against the indexer and the record store.
pub struct IndexRunner {
    indexer: Arc<dyn Indexer>,
    records: Arc<dyn RecordStore>,
    verbose: bool,
}

impl IndexRunner {
    pub fn new(indexer: Arc<dyn Indexer>, records: Arc<dyn RecordStore>, verbose: bool) -> Self {
        Self {
            indexer,
            records,
            verbose,
        }
    }

    /// Ordering per reconciling run: capture cutoff, build delta, merge or
    /// rebuild base, then (non-sharded only) clear flags `<= cutoff`.
    ///
    /// Any indexer failure returns `BuildFailed` before flags or the marker
    /// are touched. Sharded partitions leave the clear to the quorum tracker
    /// and report the cutoff instead.
    pub async fn run(&self, decision: ReindexDecision, job: &IndexJob) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport {
            index: job.index.clone(),
            decision: Some(decision),
            ..Default::default()
        };

        if decision == ReindexDecision::Skip {
            return Ok(report);
        }

        if decision.reconciles_base() {
            report.cutoff = self
                .records
                .max_delta_updated_at(&job.model)
                .await
                .map_err(ReindexError::records)?;
        }

        let delta = self.indexer.build(&job.index, self.verbose).await?;
        Self::check(&job.index, decision, &delta)?;
        report.indexer_output.push(delta.output);

        match decision {
            ReindexDecision::DeltaThenMerge => {
                let merged = self
                    .indexer
                    .merge(&job.base_index, &job.index, true)
                    .await?;
                Self::check(&job.base_index, decision, &merged)?;
                info!(index = %job.base_index, output = %merged.output.trim_end(), "merge finished");
                report.indexer_output.push(merged.output);
            }
            ReindexDecision::DeltaThenFullRebuild => {
                let rebuilt = self.indexer.rebuild(&job.base_index, true).await?;
                Self::check(&job.base_index, decision, &rebuilt)?;
                info!(index = %job.base_index, output = %rebuilt.output.trim_end(), "rebuild finished");
                report.indexer_output.push(rebuilt.output);

                // a stale marker only costs one extra rebuild next run
                report.marker_cleared = match job.clear_marker() {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(index = %job.index, error = %e, "could not remove rebuild marker");
                        false
                    }
                };
            }
            ReindexDecision::DeltaOnly | ReindexDecision::Skip => {}
        }

        if let (Some(cutoff), false) = (report.cutoff, job.sharded) {
            report.rows_cleared = self
                .records
                .clear_delta_flags(&job.model, CutoffBound::Inclusive(cutoff))
                .await
                .map_err(ReindexError::records)?;
            info!(
                index = %job.index,
                model = %job.model,
                cutoff = %cutoff,
                rows = report.rows_cleared,
                "cleared delta flags"
            );
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn check(index: &str, decision: ReindexDecision, out: &IndexerOutput) -> Result<()> {
        if out.success {
            return Ok(());
        }
        Err(ReindexError::BuildFailed {
            index: index.to_string(),
            decision,
            status: out.status.clone(),
            output: out.output.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DeltaConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use deltaindex_storage::InMemoryRecordStore;
    use parking_lot::Mutex;

    /// Records calls; fails any invocation whose target is in `fail_on`.
    #[derive(Default)]
    pub(crate) struct ScriptedIndexer {
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Vec<String>,
    }

    impl ScriptedIndexer {
        pub fn failing(target: &str) -> Self {
            Self {
                fail_on: vec![target.to_string()],
                ..Default::default()
            }
        }

        fn answer(&self, call: String, target: &str) -> Result<IndexerOutput> {
            self.calls.lock().push(call);
            if self.fail_on.iter().any(|t| t == target) {
                Ok(IndexerOutput::failed("exit status: 1", format!("ERROR: {}", target)))
            } else {
                Ok(IndexerOutput::ok(format!("indexed {}", target)))
            }
        }
    }

    #[async_trait]
    impl Indexer for ScriptedIndexer {
        async fn build(&self, index: &str, _verbose: bool) -> Result<IndexerOutput> {
            self.answer(format!("build {}", index), index)
        }

        async fn merge(&self, base: &str, delta: &str, _rotate: bool) -> Result<IndexerOutput> {
            self.answer(format!("merge {} {}", base, delta), base)
        }

        async fn rebuild(&self, base: &str, _rotate: bool) -> Result<IndexerOutput> {
            self.answer(format!("rebuild {}", base), base)
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        job: IndexJob,
        records: Arc<InMemoryRecordStore>,
    }

    fn fixture(index: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = DeltaConfig {
            indices_location: dir.path().join("indices"),
            marker_dir: dir.path().join("markers"),
            ..DeltaConfig::default()
        };
        let job = IndexJob::new(index, &config).unwrap();
        let records = Arc::new(InMemoryRecordStore::new());
        Fixture {
            _dir: dir,
            job,
            records,
        }
    }

    #[tokio::test]
    async fn test_delta_only_never_clears_flags() {
        let fx = fixture("articles_delta");
        fx.records.touch("articles", 1, at(10));
        let indexer = Arc::new(ScriptedIndexer::default());
        let runner = IndexRunner::new(indexer.clone(), fx.records.clone(), false);

        let report = runner
            .run(ReindexDecision::DeltaOnly, &fx.job)
            .await
            .unwrap();

        assert_eq!(*indexer.calls.lock(), vec!["build articles_delta"]);
        assert_eq!(report.cutoff, None);
        assert_eq!(report.rows_cleared, 0);
        assert_eq!(fx.records.pending_ids("articles"), vec![1]);
    }

    #[tokio::test]
    async fn test_merge_clears_up_to_cutoff() {
        let fx = fixture("articles_delta");
        fx.records.touch("articles", 1, at(10));
        fx.records.touch("articles", 2, at(20));
        let indexer = Arc::new(ScriptedIndexer::default());
        let runner = IndexRunner::new(indexer.clone(), fx.records.clone(), false);

        let report = runner
            .run(ReindexDecision::DeltaThenMerge, &fx.job)
            .await
            .unwrap();

        assert_eq!(
            *indexer.calls.lock(),
            vec!["build articles_delta", "merge articles_core articles_delta"]
        );
        assert_eq!(report.cutoff, Some(at(20)));
        assert_eq!(report.rows_cleared, 2);
        assert!(fx.records.pending_ids("articles").is_empty());
    }

    /// A row saved while the indexer runs must stay pending.
    struct TouchDuringBuild {
        inner: ScriptedIndexer,
        records: Arc<InMemoryRecordStore>,
    }

    #[async_trait]
    impl Indexer for TouchDuringBuild {
        async fn build(&self, index: &str, verbose: bool) -> Result<IndexerOutput> {
            self.records.touch("articles", 99, at(25));
            self.inner.build(index, verbose).await
        }

        async fn merge(&self, base: &str, delta: &str, rotate: bool) -> Result<IndexerOutput> {
            self.inner.merge(base, delta, rotate).await
        }

        async fn rebuild(&self, base: &str, rotate: bool) -> Result<IndexerOutput> {
            self.inner.rebuild(base, rotate).await
        }
    }

    #[tokio::test]
    async fn test_cutoff_is_captured_before_build() {
        let fx = fixture("articles_delta");
        fx.records.touch("articles", 1, at(20));
        let indexer = Arc::new(TouchDuringBuild {
            inner: ScriptedIndexer::default(),
            records: fx.records.clone(),
        });
        let runner = IndexRunner::new(indexer, fx.records.clone(), false);

        let report = runner
            .run(ReindexDecision::DeltaThenFullRebuild, &fx.job)
            .await
            .unwrap();

        assert_eq!(report.cutoff, Some(at(20)));
        assert_eq!(fx.records.pending_ids("articles"), vec![99]);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_flags_and_marker() {
        let fx = fixture("articles_delta");
        fx.records.touch("articles", 1, at(10));
        fx.job.request_full_rebuild().unwrap();
        let indexer = Arc::new(ScriptedIndexer::failing("articles_core"));
        let runner = IndexRunner::new(indexer, fx.records.clone(), false);

        let err = runner
            .run(ReindexDecision::DeltaThenFullRebuild, &fx.job)
            .await
            .unwrap_err();

        match err {
            ReindexError::BuildFailed {
                index,
                decision,
                output,
                ..
            } => {
                assert_eq!(index, "articles_core");
                assert_eq!(decision, ReindexDecision::DeltaThenFullRebuild);
                assert!(output.contains("ERROR"));
            }
            other => panic!("Expected BuildFailed, got {:?}", other),
        }
        assert!(fx.job.has_marker());
        assert_eq!(fx.records.pending_ids("articles"), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_delta_build_skips_merge() {
        let fx = fixture("articles_delta");
        fx.records.touch("articles", 1, at(10));
        let indexer = Arc::new(ScriptedIndexer::failing("articles_delta"));
        let runner = IndexRunner::new(indexer.clone(), fx.records.clone(), false);

        assert!(runner
            .run(ReindexDecision::DeltaThenMerge, &fx.job)
            .await
            .is_err());
        assert_eq!(*indexer.calls.lock(), vec!["build articles_delta"]);
        assert_eq!(fx.records.pending_ids("articles"), vec![1]);
    }

    #[tokio::test]
    async fn test_successful_rebuild_removes_marker() {
        let fx = fixture("articles_delta");
        fx.job.request_full_rebuild().unwrap();
        let runner = IndexRunner::new(
            Arc::new(ScriptedIndexer::default()),
            fx.records.clone(),
            false,
        );

        let report = runner
            .run(ReindexDecision::DeltaThenFullRebuild, &fx.job)
            .await
            .unwrap();

        assert!(report.marker_cleared);
        assert!(!fx.job.has_marker());
        // nothing pending, nothing to clear
        assert_eq!(report.cutoff, None);
        assert_eq!(report.rows_cleared, 0);
    }

    #[tokio::test]
    async fn test_sharded_partition_defers_clear() {
        let fx = fixture("incident_p1_delta");
        fx.records.touch("incidents", 1, at(10));
        let runner = IndexRunner::new(
            Arc::new(ScriptedIndexer::default()),
            fx.records.clone(),
            false,
        );

        let report = runner
            .run(ReindexDecision::DeltaThenMerge, &fx.job)
            .await
            .unwrap();

        assert_eq!(report.cutoff, Some(at(10)));
        assert_eq!(report.rows_cleared, 0);
        assert_eq!(fx.records.pending_ids("incidents"), vec![1]);
    }

    #[tokio::test]
    async fn test_skip_invokes_nothing() {
        let fx = fixture("articles_delta");
        let indexer = Arc::new(ScriptedIndexer::default());
        let runner = IndexRunner::new(indexer.clone(), fx.records.clone(), false);

        let report = runner.run(ReindexDecision::Skip, &fx.job).await.unwrap();
        assert!(indexer.calls.lock().is_empty());
        assert_eq!(report.decision, Some(ReindexDecision::Skip));
    }
}
