//! Obfuscator backends.
//!
//! The pipeline only sees the [`Obfuscator`] trait; the real tool is an
//! external CLI driven by [`CommandObfuscator`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ObfuscateError;

/// Default obfuscator binary.
pub const DEFAULT_OBFUSCATOR: &str = "javascript-obfuscator";

/// Transforms one JavaScript source.
#[async_trait]
pub trait Obfuscator: Send + Sync {
    /// Identifies the tool and its settings; part of every cache key.
    fn fingerprint(&self) -> String;

    /// Obfuscates `source`, which was read from `origin`.
    async fn obfuscate(&self, source: &[u8], origin: &Path) -> Result<Vec<u8>, ObfuscateError>;
}

/// Returns the source unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughObfuscator;

#[async_trait]
impl Obfuscator for PassthroughObfuscator {
    fn fingerprint(&self) -> String {
        "passthrough".to_string()
    }

    async fn obfuscate(&self, source: &[u8], _origin: &Path) -> Result<Vec<u8>, ObfuscateError> {
        Ok(source.to_vec())
    }
}

/// Runs `<program> <input> --output <tmp> [args...]` per file.
#[derive(Debug, Clone)]
pub struct CommandObfuscator {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
    scratch: PathBuf,
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

impl CommandObfuscator {
    /// Resolves `program` on `PATH` (or as a path).
    pub fn new(program: &str) -> Result<Self, ObfuscateError> {
        let resolved =
            which::which(program).map_err(|_| ObfuscateError::NotFound(program.to_string()))?;
        tracing::debug!("Using obfuscator at {}", resolved.display());
        Ok(Self {
            program: resolved,
            args: Vec::new(),
            timeout: None,
            scratch: std::env::temp_dir(),
        })
    }

    /// Appends extra arguments after `--output <tmp>`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kills a run that exceeds `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Directory for intermediate output files.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = dir.into();
        self
    }

    /// Resolved program path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn scratch_file(&self) -> PathBuf {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        self.scratch
            .join(format!("rulecast-obf-{}-{}.js", std::process::id(), seq))
    }
}

#[async_trait]
impl Obfuscator for CommandObfuscator {
    fn fingerprint(&self) -> String {
        format!("command:{}:{}", self.program.display(), self.args.join(" "))
    }

    async fn obfuscate(&self, _source: &[u8], origin: &Path) -> Result<Vec<u8>, ObfuscateError> {
        let out_path = self.scratch_file();

        let mut cmd = Command::new(&self.program);
        cmd.arg(origin)
            .arg("--output")
            .arg(&out_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| ObfuscateError::Timeout(limit))??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&out_path).await;
            return Err(ObfuscateError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let bytes = tokio::fs::read(&out_path).await;
        let _ = tokio::fs::remove_file(&out_path).await;
        let bytes = bytes?;
        if bytes.is_empty() {
            return Err(ObfuscateError::EmptyOutput);
        }
        Ok(bytes)
    }
}
