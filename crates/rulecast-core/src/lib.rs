//! Rulecast Core - rules model, loader, and client config renderers.
//!
//! This crate turns one YAML rules file into configuration for several proxy
//! clients. It performs no I/O beyond reading the rules file; writing the
//! generated artifacts is the caller's job.
//!
//! ## Architecture
//!
//! ```text
//! master-rules.yaml ──► load_rules() ──► RulesDoc ──► Target::renderer()
//!                          │                              │
//!                          ▼                              ▼
//!                    Diagnostics              Vec<Artifact> per client
//!                  (lenient mode)
//! ```
//!
//! ## Validation
//!
//! In [`ValidationMode::Lenient`] invalid entries are dropped and reported as
//! [`Diagnostic`]s; in [`ValidationMode::Strict`] the first one fails the load.

pub mod error;
pub mod loader;
pub mod model;
pub mod options;
pub mod render;

pub use error::{CoreError, RenderError, Result};
pub use loader::{load_rules, parse_rules, Diagnostic, Loaded, ValidationMode};
pub use model::{
    ExternalRuleSet, Group, GroupKind, Proxy, ProxyKind, Rule, RuleEntry, RuleKind,
    RuleSetBehavior, RulesDoc, Scripts,
};
pub use options::{RejectMode, RenderOptions};
pub use render::{render_targets, Artifact, Renderer, Target};

/// Default rules file name.
pub const DEFAULT_RULES_FILE: &str = "master-rules.yaml";
