//! Bounded payload runner.
//!
//! Each `*.js` source under the scripts directory becomes one
//! `<stem>.js.b64` file in the payload directory. Jobs run concurrently up to
//! `max_jobs`; a failing payload is reported and the rest carry on. Nothing
//! already written is rolled back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::cache::BuildCache;
use crate::error::{BundleError, ObfuscateError, Result};
use crate::obfuscator::Obfuscator;

/// The loader ships as-is and is never treated as a payload.
pub const LOADER_FILE: &str = "mitm-loader.js";

/// Suffix of encoded payload files.
pub const PAYLOAD_SUFFIX: &str = ".js.b64";

/// A payload that was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadOutput {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Served from the build cache.
    pub cached: bool,
}

/// A payload that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFailure {
    pub source: PathBuf,
    pub reason: String,
}

/// Outcome of a runner pass.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Written payloads, sorted by output path.
    pub written: Vec<PayloadOutput>,
    /// Skipped payloads, sorted by source path.
    pub failed: Vec<PayloadFailure>,
}

impl RunReport {
    /// Number of payloads served from cache.
    pub fn cache_hits(&self) -> usize {
        self.written.iter().filter(|p| p.cached).count()
    }

    /// Returns true when every payload was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs the obfuscator over a scripts directory.
pub struct PayloadRunner {
    obfuscator: Arc<dyn Obfuscator>,
    cache: Option<BuildCache>,
    max_jobs: usize,
}

impl PayloadRunner {
    /// Creates a runner with one job and no cache.
    pub fn new(obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self {
            obfuscator,
            cache: None,
            max_jobs: 1,
        }
    }

    /// Sets the worker limit (at least one).
    pub fn with_max_jobs(mut self, jobs: usize) -> Self {
        self.max_jobs = jobs.max(1);
        self
    }

    /// Enables the build cache.
    pub fn with_cache(mut self, cache: Option<BuildCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Lists payload sources under `dir`, sorted, excluding the loader.
    pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(BundleError::MissingDir(dir.to_path_buf()));
        }
        let mut sources = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("js") {
                continue;
            }
            if entry.file_name() == LOADER_FILE {
                continue;
            }
            sources.push(path.to_path_buf());
        }
        Ok(sources)
    }

    /// Output file name for a payload source.
    pub fn output_name(source: &Path) -> Option<String> {
        let stem = source.file_stem()?.to_str()?;
        Some(format!("{}{}", stem, PAYLOAD_SUFFIX))
    }

    /// Obfuscates and encodes every payload in `scripts_dir` into `out_dir`.
    pub async fn run(&self, scripts_dir: &Path, out_dir: &Path) -> Result<RunReport> {
        let sources = Self::discover(scripts_dir)?;
        tokio::fs::create_dir_all(out_dir).await?;
        tracing::info!(
            "Processing {} payload(s) with up to {} job(s)",
            sources.len(),
            self.max_jobs
        );

        let mut report = RunReport::default();
        let mut claimed: HashMap<String, PathBuf> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut jobs = JoinSet::new();

        for source in sources {
            let Some(name) = Self::output_name(&source) else {
                report.failed.push(PayloadFailure {
                    source,
                    reason: "file name is not valid UTF-8".to_string(),
                });
                continue;
            };
            if let Some(first) = claimed.get(&name) {
                report.failed.push(PayloadFailure {
                    reason: format!("{} already produced by {}", name, first.display()),
                    source,
                });
                continue;
            }
            claimed.insert(name.clone(), source.clone());

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BundleError::Task(e.to_string()))?;
            let obfuscator = Arc::clone(&self.obfuscator);
            let cache = self.cache.clone();
            let output = out_dir.join(name);
            jobs.spawn(async move {
                let result = process(obfuscator.as_ref(), cache.as_ref(), &source, &output).await;
                drop(permit);
                (source, output, result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            let (source, output, result) = joined.map_err(|e| BundleError::Task(e.to_string()))?;
            match result {
                Ok(cached) => {
                    tracing::debug!(
                        "{} -> {}{}",
                        source.display(),
                        output.display(),
                        if cached { " (cached)" } else { "" }
                    );
                    report.written.push(PayloadOutput { source, output, cached });
                }
                Err(e) => {
                    tracing::warn!("Skipping payload {}: {}", source.display(), e);
                    report.failed.push(PayloadFailure {
                        source,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.written.sort_by(|a, b| a.output.cmp(&b.output));
        report.failed.sort_by(|a, b| a.source.cmp(&b.source));
        tracing::info!(
            "Payloads: {} written ({} cached), {} failed",
            report.written.len(),
            report.cache_hits(),
            report.failed.len()
        );
        Ok(report)
    }
}

/// Handles one payload; returns whether the cache served it.
async fn process(
    obfuscator: &dyn Obfuscator,
    cache: Option<&BuildCache>,
    source: &Path,
    output: &Path,
) -> std::result::Result<bool, ObfuscateError> {
    let code = tokio::fs::read(source).await?;
    let key = BuildCache::key(&obfuscator.fingerprint(), &code);

    if let Some(cache) = cache {
        if let Some(encoded) = cache.load(&key).await {
            tokio::fs::write(output, encoded).await?;
            return Ok(true);
        }
    }

    let obfuscated = obfuscator.obfuscate(&code, source).await?;
    if obfuscated.is_empty() {
        return Err(ObfuscateError::EmptyOutput);
    }
    let encoded = STANDARD.encode(&obfuscated);
    tokio::fs::write(output, encoded.as_bytes()).await?;

    if let Some(cache) = cache {
        if let Err(e) = cache.store(&key, encoded.as_bytes()).await {
            tracing::warn!("Failed to cache {}: {}", source.display(), e);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscator::PassthroughObfuscator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scripts(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        dir
    }

    /// Records peak concurrency and fails on sources containing "boom".
    #[derive(Default)]
    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Obfuscator for Probe {
        fn fingerprint(&self) -> String {
            "probe".to_string()
        }

        async fn obfuscate(&self, source: &[u8], _origin: &Path) -> std::result::Result<Vec<u8>, ObfuscateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if source.windows(4).any(|w| w == b"boom") {
                return Err(ObfuscateError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            Ok(source.to_vec())
        }
    }

    // ==================== Discovery Tests ====================

    #[test]
    fn discover_sorts_and_skips_loader() {
        let dir = scripts(&[
            ("b.js", "b"),
            ("a.js", "a"),
            ("mitm-loader.js", "loader"),
            ("notes.txt", "x"),
            ("nested/c.js", "c"),
        ]);
        let found: Vec<String> = PayloadRunner::discover(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(found, vec!["a.js", "b.js", "nested/c.js"]);
    }

    #[test]
    fn discover_requires_directory() {
        let err = PayloadRunner::discover(Path::new("/nonexistent/rulecast-scripts")).unwrap_err();
        assert!(matches!(err, BundleError::MissingDir(_)));
    }

    // ==================== Run Tests ====================

    #[tokio::test]
    async fn writes_base64_payloads() {
        let src = scripts(&[("hello.js", "console.log('hi')")]);
        let out = tempfile::tempdir().unwrap();
        let report = PayloadRunner::new(Arc::new(PassthroughObfuscator))
            .run(src.path(), out.path())
            .await
            .unwrap();

        assert!(report.is_complete());
        let encoded = std::fs::read_to_string(out.path().join("hello.js.b64")).unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), b"console.log('hi')");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let files: Vec<(String, String)> = (0..8).map(|i| (format!("p{i}.js"), format!("// {i}"))).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let src = scripts(&refs);
        let out = tempfile::tempdir().unwrap();

        let probe = Arc::new(Probe::default());
        let report = PayloadRunner::new(probe.clone())
            .with_max_jobs(3)
            .run(src.path(), out.path())
            .await
            .unwrap();

        assert_eq!(report.written.len(), 8);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert!(probe.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_payloads() {
        let src = scripts(&[("a.js", "fine"), ("b.js", "boom"), ("c.js", "fine too")]);
        let out = tempfile::tempdir().unwrap();
        let report = PayloadRunner::new(Arc::new(Probe::default()))
            .with_max_jobs(2)
            .run(src.path(), out.path())
            .await
            .unwrap();

        assert_eq!(report.written.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].source.ends_with("b.js"));
        assert!(!out.path().join("b.js.b64").exists());
        assert!(out.path().join("c.js.b64").exists());
    }

    #[tokio::test]
    async fn duplicate_stems_are_rejected() {
        let src = scripts(&[("a.js", "1"), ("nested/a.js", "2")]);
        let out = tempfile::tempdir().unwrap();
        let report = PayloadRunner::new(Arc::new(PassthroughObfuscator))
            .run(src.path(), out.path())
            .await
            .unwrap();
        assert_eq!(report.written.len(), 1);
        assert!(report.failed[0].reason.contains("already produced"));
    }

    // ==================== Cache Tests ====================

    #[tokio::test]
    async fn second_run_hits_cache() {
        let src = scripts(&[("a.js", "one"), ("b.js", "two")]);
        let out = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let runner = PayloadRunner::new(probe.clone())
            .with_cache(Some(BuildCache::open(cache_dir.path()).unwrap()));

        let first = runner.run(src.path(), out.path()).await.unwrap();
        assert_eq!(first.cache_hits(), 0);
        let second = runner.run(src.path(), out.path()).await.unwrap();
        assert_eq!(second.cache_hits(), 2);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        std::fs::write(src.path().join("a.js"), "changed").unwrap();
        let third = runner.run(src.path(), out.path()).await.unwrap();
        assert_eq!(third.cache_hits(), 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn runs_under_block_on() {
        let src = scripts(&[("x.js", "x")]);
        let out = tempfile::tempdir().unwrap();
        let runner = PayloadRunner::new(Arc::new(PassthroughObfuscator));
        let report = tokio_test::block_on(runner.run(src.path(), out.path())).unwrap();
        assert_eq!(report.written.len(), 1);
    }
}
