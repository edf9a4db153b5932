//! Reindex decision policy
//!
//! `plan` is a pure function of [`IndexState`]; `IndexState::inspect` is the
//! only place that touches the filesystem.
//!
//! Policy, first match wins:
//! 1. force-rebuild marker present, or no compiled base index → full rebuild
//! 2. base index older than the merge threshold → merge
//! 3. otherwise → delta only

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::job::{IndexJob, ReindexDecision};

/// What the planner knows about an index at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub marker_present: bool,
    pub base_index_present: bool,
    /// Time since the base index was last written; `None` when unknown
    pub base_index_age: Option<Duration>,
}

impl IndexState {
    pub fn inspect(job: &IndexJob) -> Self {
        Self::inspect_at(job, SystemTime::now())
    }

    pub fn inspect_at(job: &IndexJob, now: SystemTime) -> Self {
        let base = std::fs::metadata(&job.base_index_file).ok();
        let base_index_age = base
            .as_ref()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());

        Self {
            marker_present: job.has_marker(),
            base_index_present: base.is_some(),
            base_index_age,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActionPlanner {
    merge_threshold: Duration,
}

impl ActionPlanner {
    pub fn new(merge_threshold: Duration) -> Self {
        Self { merge_threshold }
    }

    pub fn merge_threshold(&self) -> Duration {
        self.merge_threshold
    }

    /// Operator intent (the marker) outranks everything else. An unknown age
    /// counts as fresh.
    pub fn plan(&self, state: &IndexState) -> ReindexDecision {
        if state.marker_present || !state.base_index_present {
            return ReindexDecision::DeltaThenFullRebuild;
        }

        match state.base_index_age {
            Some(age) if age > self.merge_threshold => ReindexDecision::DeltaThenMerge,
            _ => ReindexDecision::DeltaOnly,
        }
    }
}
