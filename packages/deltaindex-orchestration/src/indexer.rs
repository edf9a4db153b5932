//! Invocation of the external indexing tool
//!
//! The tool is a black box: build one index, merge a delta into a base, or
//! rebuild a base. `rotate` asks it to swap the result into the serving
//! daemon atomically. A started invocation always runs to completion.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::IndexerConfig;
use crate::error::Result;

/// Captured result of one indexer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerOutput {
    pub success: bool,
    /// Exit status as reported by the OS, e.g. `exit status: 1`
    pub status: String,
    /// stdout followed by stderr
    pub output: String,
}

impl IndexerOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            output: output.into(),
        }
    }

    pub fn failed(status: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            status: status.into(),
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait Indexer: Send + Sync {
    async fn build(&self, index: &str, verbose: bool) -> Result<IndexerOutput>;

    async fn merge(&self, base: &str, delta: &str, rotate: bool) -> Result<IndexerOutput>;

    async fn rebuild(&self, base: &str, rotate: bool) -> Result<IndexerOutput>;
}

/// Spawns `<bin_path>/<binary_name> --config <config_file> …`.
#[derive(Debug, Clone)]
pub struct CommandIndexer {
    binary: PathBuf,
    config_file: PathBuf,
}

impl CommandIndexer {
    pub fn new(config: &IndexerConfig) -> Self {
        Self {
            binary: config.binary(),
            config_file: config.config_file.clone(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_file.to_string_lossy().into_owned(),
        ]
    }

    pub fn build_args(&self, index: &str, verbose: bool) -> Vec<String> {
        let mut args = self.base_args();
        if !verbose {
            args.push("--quiet".to_string());
        }
        args.push(index.to_string());
        args
    }

    pub fn merge_args(&self, base: &str, delta: &str, rotate: bool) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(["--merge".to_string(), base.to_string(), delta.to_string()]);
        if rotate {
            args.push("--rotate".to_string());
        }
        args
    }

    pub fn rebuild_args(&self, base: &str, rotate: bool) -> Vec<String> {
        let mut args = self.base_args();
        args.push(base.to_string());
        if rotate {
            args.push("--rotate".to_string());
        }
        args
    }

    /// A spawn failure is reported as a failed invocation, not an `Err`, so
    /// the caller treats it exactly like a non-zero exit.
    async fn run(&self, args: Vec<String>) -> Result<IndexerOutput> {
        debug!(binary = %self.binary.display(), args = ?args, "spawning indexer");
        let output = match Command::new(&self.binary).args(&args).output().await {
            Ok(output) => output,
            Err(e) => {
                return Ok(IndexerOutput::failed(
                    "spawn failed",
                    format!("{}: {}", self.binary.display(), e),
                ))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(IndexerOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            output: text,
        })
    }
}

#[async_trait]
impl Indexer for CommandIndexer {
    async fn build(&self, index: &str, verbose: bool) -> Result<IndexerOutput> {
        self.run(self.build_args(index, verbose)).await
    }

    async fn merge(&self, base: &str, delta: &str, rotate: bool) -> Result<IndexerOutput> {
        self.run(self.merge_args(base, delta, rotate)).await
    }

    async fn rebuild(&self, base: &str, rotate: bool) -> Result<IndexerOutput> {
        self.run(self.rebuild_args(base, rotate)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer(binary_name: &str) -> CommandIndexer {
        CommandIndexer::new(&IndexerConfig {
            bin_path: PathBuf::new(),
            binary_name: binary_name.to_string(),
            config_file: PathBuf::from("/etc/sphinx.conf"),
            quiet_deltas: true,
        })
    }

    #[test]
    fn test_argument_layout() {
        let idx = indexer("indexer");
        assert_eq!(
            idx.build_args("articles_delta", false),
            vec!["--config", "/etc/sphinx.conf", "--quiet", "articles_delta"]
        );
        assert_eq!(
            idx.build_args("articles_delta", true),
            vec!["--config", "/etc/sphinx.conf", "articles_delta"]
        );
        assert_eq!(
            idx.merge_args("articles_core", "articles_delta", true),
            vec![
                "--config",
                "/etc/sphinx.conf",
                "--merge",
                "articles_core",
                "articles_delta",
                "--rotate"
            ]
        );
        assert_eq!(
            idx.rebuild_args("articles_core", true),
            vec!["--config", "/etc/sphinx.conf", "articles_core", "--rotate"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_is_captured() {
        let ok = indexer("true").build("articles_delta", true).await.unwrap();
        assert!(ok.success);

        let failed = indexer("false").build("articles_delta", true).await.unwrap();
        assert!(!failed.success);
        assert!(failed.status.contains('1'));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_failed_run() {
        let out = indexer("deltaindex-no-such-indexer-binary")
            .rebuild("articles_core", true)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.status, "spawn failed");
    }
}
