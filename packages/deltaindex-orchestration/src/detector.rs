//! Detection of rotate/merge runs started outside our locks
//!
//! Best effort: the process table can change between the check and the run.
//! The per-index lock is the real guard; this only catches manual or cron
//! invocations of the indexer that never took it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait RunDetector: Send + Sync {
    /// Whether an indexer process is currently rotating `index`.
    async fn is_rotating(&self, index: &str) -> Result<bool>;
}

/// Never reports activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetector;

#[async_trait]
impl RunDetector for NoopDetector {
    async fn is_rotating(&self, _index: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Scans `/proc/<pid>/cmdline` for `<index>` immediately followed by `--rotate`.
///
/// On hosts without procfs nothing is found and every check returns `false`.
#[derive(Debug, Clone)]
pub struct ProcessTableDetector {
    proc_root: PathBuf,
}

impl Default for ProcessTableDetector {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessTableDetector {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn scan(proc_root: &Path, index: &str) -> std::io::Result<bool> {
        let entries = match std::fs::read_dir(proc_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        for entry in entries.flatten() {
            let is_pid = entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }

            // processes exit mid-scan; unreadable entries are skipped
            let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            if command_line_matches(&raw, index) {
                debug!(pid = ?entry.file_name(), "found rotating indexer");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `cmdline` is NUL separated; arguments are compared whole.
fn command_line_matches(raw: &[u8], index: &str) -> bool {
    let args: Vec<&[u8]> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .collect();
    args.windows(2)
        .any(|pair| pair[0] == index.as_bytes() && pair[1] == &b"--rotate"[..])
}

#[async_trait]
impl RunDetector for ProcessTableDetector {
    async fn is_rotating(&self, index: &str) -> Result<bool> {
        let root = self.proc_root.clone();
        let index = index.to_string();
        let found = tokio::task::spawn_blocking(move || Self::scan(&root, &index))
            .await
            .map_err(|e| anyhow::anyhow!("process scan panicked: {}", e))??;
        Ok(found)
    }
}
