//! Error types for loading and rendering rules.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a rules document.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The rules file does not exist.
    #[error("rules file not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// IO error while reading the rules file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The rules file is not valid YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An entry failed validation in strict mode.
    #[error("invalid {section} entry #{index}: {reason}")]
    Invalid {
        /// Section of the document (`proxies`, `rules`, ...).
        section: &'static str,
        /// Zero-based position of the entry in its section.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors raised by a single renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A proxy kind the client cannot express (strict mode only).
    #[error("{target} does not support {kind} proxy '{name}'")]
    UnsupportedProxy {
        /// Renderer target name.
        target: &'static str,
        /// Proxy name.
        name: String,
        /// Proxy kind.
        kind: String,
    },

    /// No proxy qualifies for the artifact (strict mode only).
    #[error("{target}: no eligible proxy: {reason}")]
    NoEligibleProxy {
        /// Renderer target name.
        target: &'static str,
        /// Why nothing qualified.
        reason: String,
    },

    /// Structured serialization failed.
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, CoreError>;
