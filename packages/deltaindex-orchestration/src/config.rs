//! Worker configuration
//!
//! One explicit `DeltaConfig` is built at startup and handed to each
//! component; nothing is read from process-wide state afterwards.
//!
//! # Examples
//!
//! ```rust,ignore
//! use deltaindex_orchestration::DeltaConfig;
//!
//! // Defaults: 240s lock, 1h merge threshold, quorum of 5 incident partitions
//! let config = DeltaConfig::default();
//!
//! // Versioned YAML, every field optional except `version`
//! let config = DeltaConfig::from_yaml("deltas.yaml")?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReindexError, Result};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeltaConfig {
    /// Queue the delta jobs are pushed to and pulled from
    pub queue_name: String,
    /// Per-index lock TTL; must exceed the worst-case run duration
    pub lock_timeout_secs: u64,
    /// Base index older than this gets a merge after the delta build
    pub merge_threshold_secs: u64,
    /// Directory holding compiled indices (`<base>.spl`)
    pub indices_location: PathBuf,
    /// Directory where "force full rebuild" markers are dropped
    pub marker_dir: PathBuf,
    pub delta_suffix: String,
    pub core_suffix: String,
    /// Model name -> table name, for models whose table is not the model name
    pub model_overrides: HashMap<String, String>,
    pub indexer: IndexerConfig,
    pub sharded: ShardedConfig,
    pub worker: WorkerConfig,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            queue_name: "ts_delta".to_string(),
            lock_timeout_secs: 240,
            merge_threshold_secs: 3600,
            indices_location: PathBuf::from("db/sphinx"),
            marker_dir: std::env::temp_dir(),
            delta_suffix: "_delta".to_string(),
            core_suffix: "_core".to_string(),
            model_overrides: HashMap::new(),
            indexer: IndexerConfig::default(),
            sharded: ShardedConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    /// Directory prefix of the indexer binary (may be empty to use `PATH`)
    pub bin_path: PathBuf,
    pub binary_name: String,
    pub config_file: PathBuf,
    /// Suppress indexer chatter for delta builds
    pub quiet_deltas: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            bin_path: PathBuf::new(),
            binary_name: "indexer".to_string(),
            config_file: PathBuf::from("config/sphinx.conf"),
            quiet_deltas: true,
        }
    }
}

impl IndexerConfig {
    pub fn binary(&self) -> PathBuf {
        self.bin_path.join(&self.binary_name)
    }
}

/// Indices split into partitions that reconcile together once a quorum of
/// partitions has finished a merge or rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShardedConfig {
    /// Index names starting with this prefix are partitions
    pub index_prefix: String,
    /// Coordination-store namespace of the completion set
    pub namespace: String,
    /// Model whose rows all partitions index
    pub model: String,
    pub quorum_size: usize,
    pub completion_ttl_secs: u64,
    /// Stale-holder timeout of the check-and-clear semaphore
    pub semaphore_timeout_secs: u64,
    /// How long a worker waits for the semaphore before failing the job
    pub semaphore_wait_secs: u64,
}

impl Default for ShardedConfig {
    fn default() -> Self {
        Self {
            index_prefix: "incident".to_string(),
            namespace: "incident_index".to_string(),
            model: "incidents".to_string(),
            quorum_size: 5,
            completion_ttl_secs: 6 * 3600,
            semaphore_timeout_secs: 600,
            semaphore_wait_secs: 30,
        }
    }
}

impl ShardedConfig {
    pub fn completion_ttl(&self) -> Duration {
        Duration::from_secs(self.completion_ttl_secs)
    }

    pub fn semaphore_timeout(&self) -> Duration {
        Duration::from_secs(self.semaphore_timeout_secs)
    }

    pub fn semaphore_wait(&self) -> Duration {
        Duration::from_secs(self.semaphore_wait_secs)
    }

    pub fn semaphore_key(&self) -> String {
        format!("semaphore:{}", self.namespace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Concurrent jobs per worker pool
    pub concurrency: usize,
    /// Delay before a requeued job (busy lock, retryable failure) is
    /// handed out again
    pub requeue_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            requeue_delay_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl DeltaConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn merge_threshold(&self) -> Duration {
        Duration::from_secs(self.merge_threshold_secs)
    }

    /// Table backing `model`, honoring `model_overrides`.
    pub fn table_for(&self, model: &str) -> String {
        self.model_overrides
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse YAML schema v1: a top-level `version` plus any `DeltaConfig` fields.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let version = doc
            .as_mapping_mut()
            .and_then(|map| map.remove("version"))
            .ok_or_else(|| {
                ReindexError::config(
                    "missing 'version' field; add 'version: 1' to the top of the file",
                )
            })?;

        let version: u32 = serde_yaml::from_value(version)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ReindexError::config(format!(
                "unsupported configuration version {}",
                version
            )));
        }

        let config: DeltaConfig = serde_yaml::from_value(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut doc = serde_yaml::Mapping::new();
        doc.insert(
            serde_yaml::Value::String("version".to_string()),
            serde_yaml::Value::Number(1u32.into()),
        );
        if let serde_yaml::Value::Mapping(fields) = serde_yaml::to_value(self)? {
            doc.extend(fields);
        }
        Ok(serde_yaml::to_string(&doc)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_secs == 0 {
            return Err(ReindexError::config("lock_timeout_secs must be > 0"));
        }
        if self.delta_suffix.is_empty() || self.core_suffix.is_empty() {
            return Err(ReindexError::config("index suffixes must not be empty"));
        }
        if self.delta_suffix == self.core_suffix {
            return Err(ReindexError::config(
                "delta_suffix and core_suffix must differ",
            ));
        }
        if self.sharded.quorum_size == 0 {
            return Err(ReindexError::config("sharded.quorum_size must be > 0"));
        }
        if self.sharded.completion_ttl_secs == 0 || self.sharded.semaphore_timeout_secs == 0 {
            return Err(ReindexError::config(
                "sharded completion_ttl_secs and semaphore_timeout_secs must be > 0",
            ));
        }
        if self.sharded.namespace.is_empty() {
            return Err(ReindexError::config("sharded.namespace must not be empty"));
        }
        if self.worker.concurrency == 0 {
            return Err(ReindexError::config("worker.concurrency must be > 0"));
        }
        Ok(())
    }
}
