//! Build orchestration.
//!
//! Steps run in order and the first error stops the build:
//!
//! 1. load and normalize the rules file
//! 2. render every requested client
//! 3. write configs (and `rules.json` with `--emit-json`)
//! 4. obfuscate and encode payloads into `web/`
//! 5. rebuild `web/manifest.json` from the directory
//! 6. write the site pages and `build-info.json`
//! 7. run the empty-output guard

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rulecast_bundle::{
    write_site, BuildCache, BuildInfo, CommandObfuscator, Manifest, Obfuscator, OutputGuard,
    PassthroughObfuscator, PayloadRunner, SiteInfo, BUILD_INFO_FILE, CATALOG_FILE, INDEX_FILE,
    LOADER_FILE, MANIFEST_FILE, PAYLOAD_SUFFIX, WEB_DIR,
};
use rulecast_core::{load_rules, render_targets, Artifact, Loaded, Target};

use crate::config::Settings;

/// Normalized rules dump written by `--emit-json`.
pub const RULES_JSON: &str = "rules.json";

/// What a build produced.
#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Files written (or that would be written in a dry run), relative to the output directory.
    pub files: Vec<PathBuf>,
    /// Clients that failed to render in lenient mode.
    pub failed_targets: Vec<(Target, String)>,
    /// Entries dropped by the loader.
    pub diagnostics: usize,
    pub payloads: usize,
    pub failed_payloads: usize,
    pub cache_hits: usize,
    pub dry: bool,
}

/// Loads the rules file with the configured validation mode.
pub fn load(settings: &Settings) -> Result<Loaded> {
    let loaded = load_rules(&settings.input, settings.mode)
        .with_context(|| format!("failed to load {}", settings.input.display()))?;
    for diagnostic in &loaded.diagnostics {
        tracing::warn!("Skipped {}", diagnostic);
    }
    Ok(loaded)
}

/// Renders the requested targets. In strict mode any failure is fatal.
pub fn render_all(
    loaded: &Loaded,
    settings: &Settings,
) -> Result<(Vec<Artifact>, Vec<(Target, String)>)> {
    let mut artifacts = Vec::new();
    let mut failed = Vec::new();
    for (target, result) in render_targets(&loaded.doc, &settings.render, &settings.targets) {
        match result {
            Ok(mut produced) => artifacts.append(&mut produced),
            Err(e) if settings.render.strict => {
                return Err(e).with_context(|| format!("{} renderer failed", target));
            }
            Err(e) => failed.push((target, e.to_string())),
        }
    }
    Ok((artifacts, failed))
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(PathBuf::from(name))
}

/// Removes payloads left over from earlier builds.
fn clear_payloads(web: &Path) -> Result<()> {
    if !web.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(web)? {
        let path = entry?.path();
        let is_payload = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PAYLOAD_SUFFIX));
        if is_payload && path.is_file() {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn obfuscator(settings: &Settings) -> Result<Arc<dyn Obfuscator>> {
    if settings.skip_obfuscation {
        tracing::info!("Obfuscation skipped, payloads are only base64-encoded");
        return Ok(Arc::new(PassthroughObfuscator));
    }
    let mut command = CommandObfuscator::new(&settings.obfuscator)
        .context("obfuscator unavailable (install it or pass --skip-obfuscation)")?;
    if let Some(limit) = settings.obfuscator_timeout {
        command = command.with_timeout(limit);
    }
    Ok(Arc::new(command))
}

/// Runs a full build.
pub async fn run_build(settings: &Settings) -> Result<BuildSummary> {
    let loaded = load(settings)?;
    let (artifacts, failed_targets) = render_all(&loaded, settings)?;
    for (target, reason) in &failed_targets {
        tracing::error!("Skipping {}: {}", target, reason);
    }

    let mut summary = BuildSummary {
        diagnostics: loaded.diagnostics.len(),
        failed_targets,
        dry: settings.dry,
        ..Default::default()
    };

    if settings.dry {
        for artifact in &artifacts {
            tracing::info!(
                "[dry] would write {} ({} bytes)",
                settings.output.join(&artifact.file_name).display(),
                artifact.contents.len()
            );
            summary.files.push(PathBuf::from(&artifact.file_name));
        }
        if settings.emit_json {
            summary.files.push(PathBuf::from(RULES_JSON));
        }
        if settings.scripts.is_dir() {
            let sources = PayloadRunner::discover(&settings.scripts)?;
            tracing::info!("[dry] would process {} payload(s)", sources.len());
            summary.payloads = sources.len();
        }
        return Ok(summary);
    }

    let output = &settings.output;
    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    for artifact in &artifacts {
        summary
            .files
            .push(write_file(output, &artifact.file_name, artifact.contents.as_bytes())?);
    }
    if settings.emit_json {
        let mut json = serde_json::to_string_pretty(&loaded.doc)?;
        json.push('\n');
        summary.files.push(write_file(output, RULES_JSON, json.as_bytes())?);
    }

    let web = output.join(WEB_DIR);
    std::fs::create_dir_all(&web)?;
    clear_payloads(&web)?;

    let has_payloads = settings.scripts.is_dir()
        && !PayloadRunner::discover(&settings.scripts)?.is_empty();
    if has_payloads {
        let cache = match &settings.cache_dir {
            Some(dir) => Some(BuildCache::open(dir).with_context(|| {
                format!("failed to open build cache {}", dir.display())
            })?),
            None => None,
        };
        let report = PayloadRunner::new(obfuscator(settings)?)
            .with_max_jobs(settings.jobs)
            .with_cache(cache)
            .run(&settings.scripts, &web)
            .await?;
        for failure in &report.failed {
            tracing::error!("Payload {} failed: {}", failure.source.display(), failure.reason);
        }
        summary.payloads = report.written.len();
        summary.failed_payloads = report.failed.len();
        summary.cache_hits = report.cache_hits();
    } else if settings.scripts.is_dir() {
        tracing::info!("No payloads in {}", settings.scripts.display());
    } else {
        tracing::warn!(
            "Scripts directory {} not found, building without payloads",
            settings.scripts.display()
        );
    }

    let manifest = Manifest::scan(&web)?;
    manifest.write(&web)?;
    let info = SiteInfo::now(settings.render.git_commit.clone());
    write_site(&web, &manifest, &info)?;
    for name in [MANIFEST_FILE, CATALOG_FILE, INDEX_FILE, LOADER_FILE] {
        summary.files.push(Path::new(WEB_DIR).join(name));
    }
    summary
        .files
        .extend(manifest.entries().iter().map(|e| Path::new(WEB_DIR).join(&e.name)));

    let build_info = BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: info.commit.clone(),
        generated_at: info.generated_at,
        artifacts: summary
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        payloads: summary.payloads,
        failed_payloads: summary.failed_payloads,
    };
    build_info.write(output)?;
    summary.files.push(PathBuf::from(BUILD_INFO_FILE));

    if settings.skip_validation {
        tracing::warn!("Output validation skipped");
    } else {
        let guard = OutputGuard::new()
            .require_all(summary.files.iter().cloned())
            .skip_dir(".cache");
        guard.check(output).context("empty-output guard failed")?;
    }

    tracing::info!(
        "Build complete: {} files, {} payloads ({} cached, {} failed)",
        summary.files.len(),
        summary.payloads,
        summary.cache_hits,
        summary.failed_payloads
    );
    Ok(summary)
}

/// Renders one target. Returns the artifacts for the caller to print or write.
pub fn render_one(settings: &Settings, target: Target) -> Result<Vec<Artifact>> {
    let loaded = load(settings)?;
    let artifacts = target
        .renderer()
        .render(&loaded.doc, &settings.render)
        .with_context(|| format!("{} renderer failed", target))?;
    if artifacts.is_empty() {
        bail!("{} produced no output", target);
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{BuildArgs, RenderFlags};

    const RULES: &str = r#"
proxies:
  - { type: socks5, name: S1, host: 1.2.3.4, port: 1080, user: u, pass: p }
  - { type: http, name: H1, host: h.example.com, port: 8080 }
groups:
  Proxy: [S1, H1]
rules:
  - { type: DOMAIN-SUFFIX, value: example.org, group: Proxy }
mitm_hostnames: [api.example.com]
scripts:
  loader_url: https://cdn.example.com/web/mitm-loader.js
"#;

    struct Workspace {
        _root: tempfile::TempDir,
        input: PathBuf,
        scripts: PathBuf,
        output: PathBuf,
        cache: PathBuf,
    }

    fn workspace(rules: &str, scripts: &[(&str, &str)]) -> Workspace {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("master-rules.yaml");
        std::fs::write(&input, rules).unwrap();
        let scripts_dir = root.path().join("scripts");
        std::fs::create_dir_all(&scripts_dir).unwrap();
        for (name, body) in scripts {
            std::fs::write(scripts_dir.join(name), body).unwrap();
        }
        Workspace {
            input,
            scripts: scripts_dir,
            output: root.path().join("dist"),
            cache: root.path().join("cache"),
            _root: root,
        }
    }

    fn settings(ws: &Workspace, tweak: impl FnOnce(&mut BuildArgs)) -> Settings {
        let mut args = BuildArgs {
            render: RenderFlags {
                input: Some(ws.input.clone()),
                ..Default::default()
            },
            output: Some(ws.output.clone()),
            scripts: Some(ws.scripts.clone()),
            cache_dir: Some(ws.cache.clone()),
            skip_obfuscation: true,
            jobs: Some(2),
            ..Default::default()
        };
        tweak(&mut args);
        Settings::resolve(&args, &|_: &str| None).unwrap()
    }

    // ==================== Build Tests ====================

    #[tokio::test]
    async fn full_build_writes_everything() {
        let ws = workspace(RULES, &[("a.js", "alert(1)"), ("b.js", "alert(2)"), ("mitm-loader.js", "x")]);
        let summary = run_build(&settings(&ws, |_| {})).await.unwrap();

        for name in ["shadowrocket.conf", "stash.yaml", "loon.conf", "tunna.yaml", "proxy.mobileconfig", "build-info.json"] {
            assert!(ws.output.join(name).is_file(), "missing {name}");
        }
        assert_eq!(summary.payloads, 2);
        assert!(summary.failed_targets.is_empty());

        let web = ws.output.join(WEB_DIR);
        let manifest = Manifest::load(&web.join(MANIFEST_FILE)).unwrap();
        let names: Vec<&str> = manifest.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.js.b64", "b.js.b64"]);
        assert!(manifest.verify(&web).unwrap().is_consistent());
        assert!(web.join("index.html").is_file());
    }

    #[tokio::test]
    async fn stale_payloads_are_removed() {
        let ws = workspace(RULES, &[("a.js", "1")]);
        let web = ws.output.join(WEB_DIR);
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("old.js.b64"), "b2xk").unwrap();

        run_build(&settings(&ws, |_| {})).await.unwrap();
        assert!(!web.join("old.js.b64").exists());
        let manifest = Manifest::load(&web.join(MANIFEST_FILE)).unwrap();
        assert_eq!(
            manifest.entries().iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
            vec!["a.js.b64".to_string()]
        );
    }

    #[tokio::test]
    async fn obfuscator_not_needed_without_payloads() {
        let ws = workspace(RULES, &[]);
        let settings = settings(&ws, |a| {
            a.skip_obfuscation = false;
            a.obfuscator = Some("rulecast-no-such-obfuscator".into());
        });
        let summary = run_build(&settings).await.unwrap();
        assert_eq!(summary.payloads, 0);
        assert!(ws.output.join(WEB_DIR).join(MANIFEST_FILE).is_file());

        std::fs::write(ws.scripts.join("a.js"), "1").unwrap();
        let err = run_build(&settings).await.unwrap_err();
        assert!(format!("{:#}", err).contains("--skip-obfuscation"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let ws = workspace(RULES, &[("a.js", "1")]);
        let summary = run_build(&settings(&ws, |a| {
            a.dry = true;
            a.emit_json = true;
        }))
        .await
        .unwrap();
        assert!(summary.dry);
        assert!(summary.files.contains(&PathBuf::from("rules.json")));
        assert_eq!(summary.payloads, 1);
        assert!(!ws.output.exists());
    }

    #[tokio::test]
    async fn emit_json_and_target_selection() {
        let ws = workspace(RULES, &[]);
        run_build(&settings(&ws, |a| {
            a.emit_json = true;
            a.target = vec![Target::Loon];
        }))
        .await
        .unwrap();
        assert!(ws.output.join("loon.conf").is_file());
        assert!(!ws.output.join("stash.yaml").exists());
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ws.output.join(RULES_JSON)).unwrap()).unwrap();
        assert_eq!(json["proxies"][0]["name"], "S1");
    }

    #[tokio::test]
    async fn missing_rules_file_fails() {
        let ws = workspace(RULES, &[]);
        std::fs::remove_file(&ws.input).unwrap();
        let err = run_build(&settings(&ws, |_| {})).await.unwrap_err();
        assert!(format!("{err:#}").contains("rules file not found"));
    }

    #[tokio::test]
    async fn strict_mode_fails_on_unsupported_proxy() {
        let rules = "proxies:\n  - { type: hysteria2, name: HY, host: hy.example.com, port: 443, pass: x }\n";
        let ws = workspace(rules, &[]);

        let lenient = run_build(&settings(&ws, |a| a.target = vec![Target::Tunna])).await.unwrap();
        assert!(lenient.failed_targets.is_empty());

        let err = run_build(&settings(&ws, |a| {
            a.target = vec![Target::Tunna];
            a.render.strict = true;
        }))
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("tunna renderer failed"));
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_when_lenient() {
        let rules = "proxies:\n  - { type: socks5, name: S1, host: 1.2.3.4, port: 1080 }\n  - { type: warp, name: W, host: w, port: 1 }\n";
        let ws = workspace(rules, &[]);
        let summary = run_build(&settings(&ws, |_| {})).await.unwrap();
        assert_eq!(summary.diagnostics, 1);

        let err = run_build(&settings(&ws, |a| a.render.strict = true)).await.unwrap_err();
        assert!(format!("{err:#}").contains("proxies"));
    }

    #[tokio::test]
    async fn empty_rules_still_build() {
        let ws = workspace("", &[]);
        let summary = run_build(&settings(&ws, |_| {})).await.unwrap();
        assert!(ws.output.join("shadowrocket.conf").is_file());
        // No http proxy means no profile.
        assert!(!ws.output.join("proxy.mobileconfig").exists());
        assert_eq!(summary.payloads, 0);
    }

    // ==================== Render Tests ====================

    #[test]
    fn render_one_returns_socks5_line() {
        let ws = workspace(RULES, &[]);
        let artifacts = render_one(&settings(&ws, |_| {}), Target::Shadowrocket).unwrap();
        assert!(artifacts[0].contents.contains("S1 = socks5, 1.2.3.4, 1080, u, p"));
    }
}
