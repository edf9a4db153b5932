//! Prometheus metrics for delta workers

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts,
    Registry,
};

#[derive(Clone)]
pub struct WorkerMetrics {
    /// Labelled by `outcome`: completed, requeued, skipped_rotating,
    /// skipped_suspended, failed
    pub outcomes: IntCounterVec,
    pub quorum_triggers: IntCounter,
    pub run_seconds: Histogram,
}

impl WorkerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            outcomes: register_int_counter_vec_with_registry!(
                Opts::new("delta_worker_jobs_total", "Delta jobs by outcome"),
                &["outcome"],
                registry
            )?,
            quorum_triggers: register_int_counter_with_registry!(
                Opts::new(
                    "delta_worker_quorum_triggers_total",
                    "Sharded flag clears triggered by quorum"
                ),
                registry
            )?,
            run_seconds: register_histogram_with_registry!(
                HistogramOpts::new("delta_worker_run_seconds", "Indexer run duration")
                    .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
                registry
            )?,
        })
    }

    pub fn observe(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn count(&self, outcome: &str) -> u64 {
        self.outcomes.with_label_values(&[outcome]).get()
    }
}
