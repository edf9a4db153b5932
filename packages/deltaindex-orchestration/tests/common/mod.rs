//! Shared fixtures for worker integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deltaindex_orchestration::{
    DeltaConfig, DeltaWorker, InMemoryJobQueue, IndexJob, Indexer, IndexerOutput, NoopDetector,
    Result,
};
use deltaindex_storage::{CoordinationStore, RecordStore};
use parking_lot::Mutex;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Hook run inside an indexer invocation, e.g. to save a row mid-build.
pub type DuringRun = Box<dyn Fn(&str) + Send + Sync>;

/// Indexer double: records calls, tracks concurrency, optionally sleeps or
/// fails for chosen targets.
#[derive(Default)]
pub struct FakeIndexer {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Vec<String>,
    pub delay: Duration,
    pub during_run: Option<DuringRun>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeIndexer {
    pub fn failing(target: &str) -> Self {
        Self {
            fail_on: vec![target.to_string()],
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn invoke(&self, call: String, target: &str) -> Result<IndexerOutput> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(call);

        if let Some(hook) = &self.during_run {
            hook(target);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail_on.iter().any(|t| t == target) {
            Ok(IndexerOutput::failed(
                "exit status: 1",
                format!("FATAL: failed to build {}", target),
            ))
        } else {
            Ok(IndexerOutput::ok(format!("indexed {}", target)))
        }
    }
}

#[async_trait]
impl Indexer for FakeIndexer {
    async fn build(&self, index: &str, _verbose: bool) -> Result<IndexerOutput> {
        self.invoke(format!("build {}", index), index).await
    }

    async fn merge(&self, base: &str, delta: &str, _rotate: bool) -> Result<IndexerOutput> {
        self.invoke(format!("merge {} {}", base, delta), base).await
    }

    async fn rebuild(&self, base: &str, _rotate: bool) -> Result<IndexerOutput> {
        self.invoke(format!("rebuild {}", base), base).await
    }
}

pub struct Env {
    pub dir: tempfile::TempDir,
    pub config: Arc<DeltaConfig>,
    pub queue: Arc<InMemoryJobQueue>,
}

impl Env {
    pub fn new(adjust: impl FnOnce(&mut DeltaConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeltaConfig {
            indices_location: dir.path().join("indices"),
            marker_dir: dir.path().join("markers"),
            ..DeltaConfig::default()
        };
        adjust(&mut config);
        Self {
            dir,
            config: Arc::new(config),
            queue: Arc::new(InMemoryJobQueue::new()),
        }
    }

    pub fn job(&self, index: &str) -> IndexJob {
        IndexJob::new(index, &self.config).unwrap()
    }

    /// Pretend a base index was compiled for `index`.
    pub fn write_base(&self, index: &str) {
        let job = self.job(index);
        std::fs::create_dir_all(job.base_index_file.parent().unwrap()).unwrap();
        std::fs::write(&job.base_index_file, b"spl").unwrap();
    }

    pub fn worker(
        &self,
        coordination: Arc<dyn CoordinationStore>,
        records: Arc<dyn RecordStore>,
        indexer: Arc<dyn Indexer>,
    ) -> DeltaWorker {
        DeltaWorker::new(
            self.config.clone(),
            coordination,
            records,
            indexer,
            self.queue.clone(),
        )
        .with_detector(Arc::new(NoopDetector))
    }
}
