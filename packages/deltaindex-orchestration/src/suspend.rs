//! Operator switch that pauses delta processing for an index
//!
//! While suspended, jobs for the index are skipped (not requeued). Used around
//! maintenance such as a manual full reindex.

use std::sync::Arc;

use deltaindex_storage::CoordinationStore;
use tracing::info;

use crate::error::{ReindexError, Result};

#[derive(Clone)]
pub struct SuspendSwitch {
    store: Arc<dyn CoordinationStore>,
}

impl SuspendSwitch {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn key(index: &str) -> String {
        format!("suspend:delta:{}", index)
    }

    pub async fn suspend(&self, index: &str) -> Result<()> {
        self.store
            .set(&Self::key(index), "1", None)
            .await
            .map_err(ReindexError::coordination)?;
        info!(index = %index, "delta processing suspended");
        Ok(())
    }

    /// Returns `false` if the index was not suspended.
    pub async fn resume(&self, index: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(&Self::key(index))
            .await
            .map_err(ReindexError::coordination)?;
        if removed {
            info!(index = %index, "delta processing resumed");
        }
        Ok(removed)
    }

    pub async fn is_suspended(&self, index: &str) -> Result<bool> {
        self.store
            .exists(&Self::key(index))
            .await
            .map_err(ReindexError::coordination)
    }
}
