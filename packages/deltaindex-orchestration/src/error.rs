use deltaindex_storage::StorageError;
use thiserror::Error;

use crate::job::ReindexDecision;

pub type Result<T> = std::result::Result<T, ReindexError>;

#[derive(Error, Debug)]
pub enum ReindexError {
    /// Another worker holds the per-index lock; the job goes back on the queue.
    #[error("Lock busy for index {0}")]
    LockBusy(String),

    #[error("Indexer failed for {index} ({decision}), status {status}: {output}")]
    BuildFailed {
        index: String,
        decision: ReindexDecision,
        status: String,
        output: String,
    },

    #[error("Coordination store unavailable: {0}")]
    CoordinationStoreUnavailable(#[source] StorageError),

    #[error("Record store unavailable: {0}")]
    RecordStoreUnavailable(#[source] StorageError),

    #[error("Timeout acquiring semaphore {key} after {waited_ms}ms")]
    SemaphoreTimeout { key: String, waited_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReindexError {
    pub fn coordination(e: StorageError) -> Self {
        Self::CoordinationStoreUnavailable(e)
    }

    pub fn records(e: StorageError) -> Self {
        Self::RecordStoreUnavailable(e)
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ReindexError::LockBusy(_) => ErrorCategory::Expected,
            ReindexError::BuildFailed { .. }
            | ReindexError::SemaphoreTimeout { .. }
            | ReindexError::Io(_)
            | ReindexError::Other(_) => ErrorCategory::Transient,
            ReindexError::CoordinationStoreUnavailable(_)
            | ReindexError::RecordStoreUnavailable(_) => ErrorCategory::Infrastructure,
            ReindexError::Yaml(_) | ReindexError::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Control-flow signals that are not failures.
    pub fn is_expected(&self) -> bool {
        self.category() == ErrorCategory::Expected
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Expected control flow (lock busy) - not logged as error
    Expected,
    /// Transient error - requeue (e.g., indexer exit, semaphore timeout)
    Transient,
    /// Permanent error - don't retry (e.g., invalid configuration)
    Permanent,
    /// Infrastructure error - requeue and alert ops (store unreachable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Expected => "expected",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    /// Whether a failed job should go back on the queue.
    pub fn should_requeue(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
