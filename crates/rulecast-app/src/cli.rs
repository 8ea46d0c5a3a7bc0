//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rulecast_core::{RejectMode, Target};

/// Rulecast - build client proxy configs and the payload bundle from one rules file
#[derive(Parser, Debug)]
#[command(name = "rulecast", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub log: LogArgs,

    /// Defaults to `build`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Logging flags, accepted by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the whole pipeline: configs, payloads, manifest, site, validation
    Build(BuildArgs),
    /// Render a single client config
    Render(RenderArgs),
    /// Rebuild or check `manifest.json` for a payload directory
    Manifest(ManifestArgs),
    /// Run the empty-output guard over a directory
    Validate(ValidateArgs),
}

/// Flags shared by `build` and `render`.
#[derive(Args, Debug, Clone, Default)]
pub struct RenderFlags {
    /// Rules file [env: MASTER_RULES] [default: configs/master-rules.yaml]
    #[arg(long, short)]
    pub input: Option<PathBuf>,

    /// Policy for unmatched traffic
    #[arg(long)]
    pub final_group: Option<String>,

    /// DNS servers, repeatable or comma separated [env: DNS_SERVER]
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Group whose HTTP proxy goes into the profile [env: MOBILECONFIG_GROUP, PREFER_GROUP]
    #[arg(long)]
    pub prefer_group: Option<String>,

    /// Reject policy for blocked domains (reject, drop, tinygif)
    #[arg(long, default_value = "reject")]
    pub reject: RejectMode,

    /// Add explanatory comments
    #[arg(long)]
    pub annotate: bool,

    /// Emit the most compact output
    #[arg(long)]
    pub minify: bool,

    /// Fail on invalid entries instead of skipping them
    #[arg(long)]
    pub strict: bool,

    /// Use random profile UUIDs instead of content-derived ones
    #[arg(long)]
    pub random_uuids: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
    #[command(flatten)]
    pub render: RenderFlags,

    /// Output directory [default: dist]
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Payload source directory [default: scripts]
    #[arg(long, short)]
    pub scripts: Option<PathBuf>,

    /// Clients to build, repeatable (default: all)
    #[arg(long, short, value_delimiter = ',')]
    pub target: Vec<Target>,

    /// Also write the normalized rules as rules.json
    #[arg(long)]
    pub emit_json: bool,

    /// Report what would be written without writing anything
    #[arg(long)]
    pub dry: bool,

    /// Base64-encode payloads without running the obfuscator
    #[arg(long)]
    pub skip_obfuscation: bool,

    /// Skip the empty-output guard
    #[arg(long)]
    pub skip_validation: bool,

    /// Disable the payload build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Build cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Concurrent obfuscator jobs [env: BUILD_MAX_JOBS]
    #[arg(long, short)]
    pub jobs: Option<usize>,

    /// Obfuscator binary [default: javascript-obfuscator]
    #[arg(long)]
    pub obfuscator: Option<String>,

    /// Per-payload obfuscator time limit, in seconds
    #[arg(long)]
    pub obfuscator_timeout: Option<u64>,

    /// Rebuild whenever the rules file changes
    #[arg(long)]
    pub watch: bool,

    /// Polling interval for --watch, in milliseconds
    #[arg(long, default_value_t = crate::config::DEFAULT_WATCH_INTERVAL_MS)]
    pub watch_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub render: RenderFlags,

    /// Client to render
    #[arg(long, short)]
    pub target: Target,

    /// Output file (a directory when the client produces several files); stdout if omitted
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ManifestArgs {
    /// Payload directory
    #[arg(long)]
    pub dir: PathBuf,

    /// Verify the existing manifest instead of rewriting it
    #[arg(long)]
    pub check: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Output directory
    #[arg(long)]
    pub dir: PathBuf,

    /// Files that must exist and be non-empty, relative to --dir
    #[arg(long, value_delimiter = ',')]
    pub require: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_flags_parse() {
        let cli = Cli::try_parse_from([
            "rulecast",
            "--verbose",
            "build",
            "--dns",
            "1.1.1.1,8.8.8.8",
            "--target",
            "loon",
            "--target",
            "ios",
            "--reject",
            "drop",
            "--jobs",
            "4",
        ])
        .unwrap();
        assert!(cli.log.verbose);
        let Some(Command::Build(args)) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.render.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(args.target, vec![Target::Loon, Target::MobileConfig]);
        assert_eq!(args.render.reject, RejectMode::Drop);
        assert_eq!(args.jobs, Some(4));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = Cli::try_parse_from(["rulecast", "render", "--target", "quantumult"]).unwrap_err();
        assert!(err.to_string().contains("unknown target"));
    }

    #[test]
    fn build_is_default() {
        let cli = Cli::try_parse_from(["rulecast", "--debug"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.log.debug);
    }
}
