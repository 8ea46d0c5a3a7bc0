//! Rulecast - build client proxy configs and an obfuscated payload bundle
//! from one rules file.
//!
//! This crate provides the command-line application:
//!
//! - Argument parsing ([`cli`])
//! - Settings resolution from defaults, environment and flags ([`config`])
//! - Logging setup ([`logging`])
//! - The build pipeline ([`pipeline`]) and `--watch` mode ([`watch`])
//!
//! # Usage
//!
//! ```ignore
//! use rulecast::cli::BuildArgs;
//! use rulecast::config::Settings;
//!
//! let settings = Settings::from_args(&BuildArgs::default())?;
//! let summary = rulecast::pipeline::run_build(&settings).await?;
//! println!("{} files", summary.files.len());
//! ```

pub mod cli;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod watch;

pub use config::Settings;
pub use pipeline::{run_build, BuildSummary};
