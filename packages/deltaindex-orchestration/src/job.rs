use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::DeltaConfig;
use crate::error::{ReindexError, Result};

/// What a single delta job will do to its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexDecision {
    Skip,
    DeltaOnly,
    DeltaThenMerge,
    DeltaThenFullRebuild,
}

impl ReindexDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexDecision::Skip => "skip",
            ReindexDecision::DeltaOnly => "delta_only",
            ReindexDecision::DeltaThenMerge => "delta_then_merge",
            ReindexDecision::DeltaThenFullRebuild => "delta_then_full_rebuild",
        }
    }

    /// Merge and rebuild fold pending rows into the base index, so they need
    /// a cutoff captured before the build and a flag clear afterwards.
    pub fn reconciles_base(&self) -> bool {
        matches!(
            self,
            ReindexDecision::DeltaThenMerge | ReindexDecision::DeltaThenFullRebuild
        )
    }
}

impl std::fmt::Display for ReindexDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One delta run against one index. Built per invocation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexJob {
    /// Delta index name as enqueued, e.g. `articles_delta`
    pub index: String,
    /// Base index the delta reconciles into, e.g. `articles_core`
    pub base_index: String,
    /// Table whose `delta` flags this index consumes
    pub model: String,
    /// Presence forces a full rebuild on the next run
    pub marker_path: PathBuf,
    /// Compiled base index; absent means there is nothing to merge into
    pub base_index_file: PathBuf,
    /// Partition of a sharded index family
    pub sharded: bool,
}

impl IndexJob {
    pub fn new(index: &str, config: &DeltaConfig) -> Result<Self> {
        let stem = index
            .strip_suffix(config.delta_suffix.as_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                ReindexError::config(format!(
                    "index '{}' does not end with '{}'",
                    index, config.delta_suffix
                ))
            })?;

        let base_index = format!("{}{}", stem, config.core_suffix);
        let sharded =
            !config.sharded.index_prefix.is_empty() && stem.starts_with(&config.sharded.index_prefix);
        let model = if sharded {
            config.table_for(&config.sharded.model)
        } else {
            config.table_for(stem)
        };

        Ok(Self {
            index: index.to_string(),
            marker_path: config.marker_dir.join(&base_index),
            base_index_file: config
                .indices_location
                .join(format!("{}.spl", base_index)),
            base_index,
            model,
            sharded,
        })
    }

    /// Key of this partition in the completion set.
    pub fn partition_key(&self) -> &str {
        &self.index
    }

    pub fn has_marker(&self) -> bool {
        self.marker_path.exists()
    }

    /// Ask for a full rebuild on the next run of this index.
    pub fn request_full_rebuild(&self) -> Result<()> {
        if let Some(dir) = self.marker_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.marker_path, b"")?;
        Ok(())
    }

    /// Remove the marker; a missing marker is not an error.
    pub fn clear_marker(&self) -> Result<bool> {
        remove_if_exists(&self.marker_path)
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> DeltaConfig {
        DeltaConfig {
            indices_location: dir.join("indices"),
            marker_dir: dir.join("markers"),
            ..DeltaConfig::default()
        }
    }

    #[test]
    fn test_decision_names_match_serialized_form() {
        for decision in &[
            ReindexDecision::Skip,
            ReindexDecision::DeltaOnly,
            ReindexDecision::DeltaThenMerge,
            ReindexDecision::DeltaThenFullRebuild,
        ] {
            let json = serde_json::to_string(decision).unwrap();
            assert_eq!(json, format!("\"{}\"", decision));
        }
    }

    #[test]
    fn test_only_merge_and_rebuild_reconcile() {
        assert!(!ReindexDecision::Skip.reconciles_base());
        assert!(!ReindexDecision::DeltaOnly.reconciles_base());
        assert!(ReindexDecision::DeltaThenMerge.reconciles_base());
        assert!(ReindexDecision::DeltaThenFullRebuild.reconciles_base());
    }

    #[test]
    fn test_job_derives_names_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let job = IndexJob::new("articles_delta", &config).unwrap();
        assert_eq!(job.base_index, "articles_core");
        assert_eq!(job.model, "articles");
        assert_eq!(job.marker_path, dir.path().join("markers/articles_core"));
        assert_eq!(
            job.base_index_file,
            dir.path().join("indices/articles_core.spl")
        );
        assert!(!job.sharded);
    }

    #[test]
    fn test_model_override_applies() {
        let mut config = DeltaConfig::default();
        config
            .model_overrides
            .insert("contracts_contract".into(), "contracts".into());

        let job = IndexJob::new("contracts_contract_delta", &config).unwrap();
        assert_eq!(job.model, "contracts");
        assert_eq!(job.base_index, "contracts_contract_core");
    }

    #[test]
    fn test_sharded_partitions_share_model() {
        let config = DeltaConfig::default();
        let p1 = IndexJob::new("incident_p1_delta", &config).unwrap();
        let p2 = IndexJob::new("incident_p2_delta", &config).unwrap();

        assert!(p1.sharded && p2.sharded);
        assert_eq!(p1.model, "incidents");
        assert_eq!(p2.model, "incidents");
        assert_ne!(p1.partition_key(), p2.partition_key());
    }

    #[test]
    fn test_rejects_index_without_delta_suffix() {
        let config = DeltaConfig::default();
        assert!(IndexJob::new("articles_core", &config).is_err());
        assert!(IndexJob::new("_delta", &config).is_err());
    }

    #[test]
    fn test_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let job = IndexJob::new("articles_delta", &config_in(dir.path())).unwrap();

        assert!(!job.has_marker());
        job.request_full_rebuild().unwrap();
        assert!(job.has_marker());
        assert!(job.clear_marker().unwrap());
        assert!(!job.has_marker());
        assert!(!job.clear_marker().unwrap());
    }
}
