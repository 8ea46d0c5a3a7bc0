//! Error types for the payload bundle.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Bundle error type.
#[derive(Debug, Error)]
pub enum BundleError {
    /// A directory the step needs does not exist.
    #[error("directory not found: {}", .0.display())]
    MissingDir(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory walk error.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Obfuscator setup error.
    #[error("Obfuscation error: {0}")]
    Obfuscate(#[from] ObfuscateError),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Task(String),
}

/// Errors from a single obfuscator run.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// The obfuscator binary is not on `PATH`.
    #[error("obfuscator '{0}' not found on PATH")]
    NotFound(String),

    /// The process could not be started or its files could not be accessed.
    #[error("failed to run obfuscator: {0}")]
    Io(#[from] std::io::Error),

    /// The process exited unsuccessfully.
    #[error("obfuscator exited with {status}: {stderr}")]
    Failed {
        /// Exit status as reported by the OS.
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The process exceeded its time limit.
    #[error("obfuscator timed out after {0:?}")]
    Timeout(Duration),

    /// The process succeeded but wrote nothing.
    #[error("obfuscator produced empty output")]
    EmptyOutput,
}

/// Empty-output guard failure.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The output directory does not exist.
    #[error("output directory not found: {}", .0.display())]
    MissingDir(PathBuf),

    /// Required files are missing or files are empty.
    #[error("output validation failed: {} missing, {} empty ({})", .missing.len(), .empty.len(), list(.missing, .empty))]
    Failed {
        /// Required files that do not exist.
        missing: Vec<PathBuf>,
        /// Files with zero bytes.
        empty: Vec<PathBuf>,
    },

    /// IO error while scanning.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory walk error.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

fn list(missing: &[PathBuf], empty: &[PathBuf]) -> String {
    missing
        .iter()
        .chain(empty)
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;
