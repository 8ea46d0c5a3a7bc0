//! Rulecast command-line entry point.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rulecast::cli::{BuildArgs, Cli, Command, ManifestArgs, RenderArgs, ValidateArgs};
use rulecast::config::{self, Settings};
use rulecast::logging::init_logging;
use rulecast::{pipeline, watch};
use rulecast_bundle::{Manifest, OutputGuard, MANIFEST_FILE};
use rulecast_core::Artifact;

async fn build(args: BuildArgs) -> Result<()> {
    let settings = Settings::from_args(&args)?;
    tracing::debug!("Settings: {:?}", settings);

    if settings.watch {
        return watch::run(&settings).await;
    }

    let summary = pipeline::run_build(&settings).await?;
    let verb = if summary.dry { "would write" } else { "wrote" };
    println!(
        "rulecast: {} {} files into {} ({} payloads, {} failed, {} skipped entries)",
        verb,
        summary.files.len(),
        settings.output.display(),
        summary.payloads,
        summary.failed_payloads,
        summary.diagnostics
    );
    for (target, reason) in &summary.failed_targets {
        eprintln!("rulecast: {} skipped: {}", target, reason);
    }
    Ok(())
}

fn render(args: RenderArgs) -> Result<()> {
    let build_args = BuildArgs {
        render: args.render.clone(),
        target: vec![args.target],
        no_cache: true,
        ..Default::default()
    };
    let settings = Settings::from_args(&build_args)?;
    let artifacts = pipeline::render_one(&settings, args.target)?;

    match &args.output {
        Some(path) if artifacts.len() == 1 => write_artifact(path, &artifacts[0]),
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            for artifact in &artifacts {
                write_artifact(&dir.join(&artifact.file_name), artifact)?;
            }
            Ok(())
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            for artifact in &artifacts {
                if artifacts.len() > 1 {
                    writeln!(stdout, "# ==> {} <==", artifact.file_name)?;
                }
                stdout.write_all(artifact.contents.as_bytes())?;
            }
            Ok(())
        }
    }
}

fn write_artifact(path: &Path, artifact: &Artifact) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &artifact.contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("Wrote {} to {}", artifact.file_name, path.display());
    Ok(())
}

fn manifest(args: ManifestArgs) -> Result<()> {
    if args.check {
        let existing = Manifest::load(&args.dir.join(MANIFEST_FILE))
            .with_context(|| format!("failed to read {} in {}", MANIFEST_FILE, args.dir.display()))?;
        let check = existing.verify(&args.dir)?;
        if !check.is_consistent() {
            bail!(
                "manifest out of date: missing {:?}, extra {:?}, changed {:?}, duplicate {:?}",
                check.missing,
                check.extra,
                check.changed,
                check.duplicate
            );
        }
        println!("rulecast: manifest matches {} payloads", existing.len());
        return Ok(());
    }

    let manifest = Manifest::scan(&args.dir)?;
    let path = manifest.write(&args.dir)?;
    println!("rulecast: wrote {} ({} payloads)", path.display(), manifest.len());
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let scanned = OutputGuard::new()
        .require_all(args.require)
        .skip_dir(".cache")
        .check(&args.dir)?;
    println!("rulecast: {} files ok", scanned);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_logging(&cli.log);
    tracing::debug!("rulecast {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or_else(|| Command::Build(BuildArgs {
        watch_interval: config::DEFAULT_WATCH_INTERVAL_MS,
        ..Default::default()
    })) {
        Command::Build(args) => build(args).await,
        Command::Render(args) => render(args),
        Command::Manifest(args) => manifest(args),
        Command::Validate(args) => validate(args),
    }
}
