//! Build settings.
//!
//! Resolved once per run from defaults, then environment variables, then
//! command-line flags (later wins), and passed explicitly from there on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use directories::ProjectDirs;
use rulecast_bundle::DEFAULT_OBFUSCATOR;
use rulecast_core::{RenderOptions, Target, ValidationMode};

use crate::cli::{BuildArgs, RenderFlags};

/// Default rules file.
pub const DEFAULT_INPUT: &str = "configs/master-rules.yaml";
/// Default output directory.
pub const DEFAULT_OUTPUT: &str = "dist";
/// Default payload source directory.
pub const DEFAULT_SCRIPTS: &str = "scripts";
/// Default `--watch` polling interval, in milliseconds.
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

/// Environment variable names.
pub mod vars {
    pub const MASTER_RULES: &str = "MASTER_RULES";
    pub const DNS_SERVER: &str = "DNS_SERVER";
    pub const MOBILECONFIG_GROUP: &str = "MOBILECONFIG_GROUP";
    pub const PREFER_GROUP: &str = "PREFER_GROUP";
    pub const BUILD_MAX_JOBS: &str = "BUILD_MAX_JOBS";
    pub const GIT_COMMIT: &str = "GIT_COMMIT";
}

/// Environment lookup; tests pass a closure over a map.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads the process environment, treating empty values as unset.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Everything a build needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub output: PathBuf,
    pub scripts: PathBuf,
    pub targets: Vec<Target>,
    pub render: RenderOptions,
    pub mode: ValidationMode,
    pub emit_json: bool,
    pub dry: bool,
    pub skip_obfuscation: bool,
    pub skip_validation: bool,
    /// `None` when caching is disabled.
    pub cache_dir: Option<PathBuf>,
    pub jobs: usize,
    pub obfuscator: String,
    pub obfuscator_timeout: Option<Duration>,
    pub watch: bool,
    pub watch_interval: Duration,
}

impl Settings {
    /// Resolves settings against the process environment.
    pub fn from_args(args: &BuildArgs) -> Result<Self> {
        Self::resolve(args, &process_env)
    }

    /// Resolves settings against an arbitrary environment.
    pub fn resolve(args: &BuildArgs, env: EnvLookup<'_>) -> Result<Self> {
        let input = input_path(&args.render, env);
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

        let jobs = match args.jobs {
            Some(0) => bail!("--jobs must be at least 1"),
            Some(n) => n,
            None => match env(vars::BUILD_MAX_JOBS) {
                Some(raw) => match raw.trim().parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => bail!("{} must be a positive integer, got '{}'", vars::BUILD_MAX_JOBS, raw),
                },
                None => default_jobs(),
            },
        };

        let cache_dir = if args.no_cache {
            None
        } else {
            Some(
                args.cache_dir
                    .clone()
                    .unwrap_or_else(|| default_cache_dir(&output)),
            )
        };

        let targets = if args.target.is_empty() {
            Target::ALL.to_vec()
        } else {
            let mut targets = args.target.clone();
            targets.sort();
            targets.dedup();
            targets
        };

        Ok(Self {
            render: render_options(&args.render, &input, env),
            mode: ValidationMode::from_strict(args.render.strict),
            input,
            scripts: args
                .scripts
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPTS)),
            output,
            targets,
            emit_json: args.emit_json,
            dry: args.dry,
            skip_obfuscation: args.skip_obfuscation,
            skip_validation: args.skip_validation,
            cache_dir,
            jobs,
            obfuscator: args
                .obfuscator
                .clone()
                .unwrap_or_else(|| DEFAULT_OBFUSCATOR.to_string()),
            obfuscator_timeout: args.obfuscator_timeout.map(Duration::from_secs),
            watch: args.watch,
            watch_interval: Duration::from_millis(args.watch_interval.max(50)),
        })
    }
}

/// Rules file: flag, then `MASTER_RULES`, then the default.
pub fn input_path(flags: &RenderFlags, env: EnvLookup<'_>) -> PathBuf {
    flags
        .input
        .clone()
        .or_else(|| env(vars::MASTER_RULES).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT))
}

/// Builds renderer options from flags and environment.
pub fn render_options(flags: &RenderFlags, input: &Path, env: EnvLookup<'_>) -> RenderOptions {
    let dns = if flags.dns.is_empty() {
        env(vars::DNS_SERVER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    } else {
        flags
            .dns
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    let prefer_group = flags
        .prefer_group
        .clone()
        .or_else(|| env(vars::MOBILECONFIG_GROUP))
        .or_else(|| env(vars::PREFER_GROUP));

    RenderOptions {
        dns,
        final_group: flags.final_group.clone(),
        prefer_group,
        reject: flags.reject,
        annotate: flags.annotate,
        minify: flags.minify,
        strict: flags.strict,
        random_uuids: flags.random_uuids,
        source_label: input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string()),
        git_commit: env(vars::GIT_COMMIT),
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_cache_dir(output: &Path) -> PathBuf {
    ProjectDirs::from("", "rulecast", "Rulecast")
        .map(|dirs| dirs.cache_dir().join("payloads"))
        .unwrap_or_else(|| output.join(".cache"))
}
