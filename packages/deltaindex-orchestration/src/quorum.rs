//! Completion quorum for sharded indices
//!
//! Every partition of a sharded index indexes rows of the same model, so no
//! single partition may clear their flags. Each partition records the cutoff
//! it reconciled up to; once `quorum_size` distinct partitions have recorded,
//! flags older than the smallest cutoff are cleared and the set starts over.
//!
//! Completion entries carry a TTL, so a cycle that never reaches quorum
//! (a partition stopped running) eventually forgets stale cutoffs.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use deltaindex_storage::{namespaced, CoordinationStore, CutoffBound, RecordStore, StorageError};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ShardedConfig;
use crate::error::{ReindexError, Result};
use crate::lock::{Lease, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QuorumOutcome {
    /// Fewer than `quorum` partitions have recorded this cycle
    Accumulating { recorded: usize, quorum: usize },
    /// Quorum reached: flags cleared below `min_cutoff`, set wiped
    Triggered {
        min_cutoff: DateTime<Utc>,
        partitions: Vec<String>,
        rows_cleared: u64,
    },
}

impl QuorumOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, QuorumOutcome::Triggered { .. })
    }
}

pub struct QuorumTracker {
    coordination: Arc<dyn CoordinationStore>,
    records: Arc<dyn RecordStore>,
    config: ShardedConfig,
    semaphore: Semaphore,
}

impl QuorumTracker {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        records: Arc<dyn RecordStore>,
        config: ShardedConfig,
    ) -> Self {
        let semaphore = Semaphore::new(
            coordination.clone(),
            config.semaphore_key(),
            config.semaphore_timeout(),
            config.semaphore_wait(),
        );
        Self {
            coordination,
            records,
            config,
            semaphore,
        }
    }

    /// Record that `partition` finished reconciling up to `cutoff`.
    ///
    /// First write wins within a cycle; returns `false` for a repeat.
    pub async fn record(&self, partition: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let key = namespaced(&self.config.namespace, partition);
        let value = cutoff.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let inserted = self
            .coordination
            .set_if_absent(&key, &value, self.config.completion_ttl())
            .await
            .map_err(ReindexError::coordination)?;

        debug!(partition = %partition, cutoff = %value, inserted, "recorded partition completion");
        Ok(inserted)
    }

    /// Live completions of the current cycle, sorted by partition.
    pub async fn completions(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let prefix = format!("{}:", self.config.namespace);
        let keys = self
            .coordination
            .list_keys(&prefix)
            .await
            .map_err(ReindexError::coordination)?;

        let mut completions = Vec::with_capacity(keys.len());
        for key in keys {
            // expired between list and read
            let Some(raw) = self
                .coordination
                .get(&key)
                .await
                .map_err(ReindexError::coordination)?
            else {
                continue;
            };

            let cutoff = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| {
                    ReindexError::coordination(
                        StorageError::serialization(format!(
                            "Invalid completion value for {}: {:?}",
                            key, raw
                        ))
                        .with_source(e),
                    )
                })?
                .with_timezone(&Utc);

            let partition = key[prefix.len()..].to_string();
            completions.push((partition, cutoff));
        }
        Ok(completions)
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Clear and wipe if quorum is reached.
    ///
    /// `held` must be a lease on this tracker's semaphore; any other lease is
    /// rejected before the store is touched.
    pub async fn check_and_clear(&self, held: &Lease) -> Result<QuorumOutcome> {
        if held.key() != self.semaphore.key() {
            return Err(ReindexError::config(format!(
                "check_and_clear needs the {} lease, got {}",
                self.semaphore.key(),
                held.key()
            )));
        }

        let completions = self.completions().await?;
        let quorum = self.config.quorum_size;

        let Some(min_cutoff) = completions
            .iter()
            .map(|(_, cutoff)| *cutoff)
            .min()
            .filter(|_| completions.len() >= quorum)
        else {
            return Ok(QuorumOutcome::Accumulating {
                recorded: completions.len(),
                quorum,
            });
        };

        // a failed clear leaves the set intact for the next attempt
        let rows_cleared = self
            .records
            .clear_delta_flags(&self.config.model, CutoffBound::Exclusive(min_cutoff))
            .await
            .map_err(ReindexError::records)?;

        self.coordination
            .flush(&self.config.namespace)
            .await
            .map_err(ReindexError::coordination)?;

        let partitions: Vec<String> = completions.into_iter().map(|(p, _)| p).collect();
        info!(
            namespace = %self.config.namespace,
            model = %self.config.model,
            min_cutoff = %min_cutoff,
            partitions = partitions.len(),
            rows = rows_cleared,
            "quorum reached, cleared delta flags"
        );

        Ok(QuorumOutcome::Triggered {
            min_cutoff,
            partitions,
            rows_cleared,
        })
    }

    /// `record` followed by `check_and_clear`, both under the shared
    /// semaphore. An insert outside it can land between another worker's
    /// list and flush and be wiped with the finished cycle.
    pub async fn record_and_check(
        &self,
        partition: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<QuorumOutcome> {
        let lease = self.semaphore.acquire().await?;
        let outcome = match self.record(partition, cutoff).await {
            Ok(_) => self.check_and_clear(&lease).await,
            Err(e) => Err(e),
        };
        lease.release().await?;
        outcome
    }
}
