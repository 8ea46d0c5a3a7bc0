//! `--watch`: rebuild when the rules file changes.
//!
//! Polls the file's modification time; a failed build is logged and the
//! watcher keeps going.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Result;

use crate::config::Settings;
use crate::pipeline;

/// Modification time, or `None` if the file is missing.
pub fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Waits until the modification time differs from `last`, returning the new one.
pub async fn wait_for_change(
    path: &Path,
    last: Option<SystemTime>,
    interval: Duration,
) -> Option<SystemTime> {
    loop {
        tokio::time::sleep(interval).await;
        let current = modified(path);
        if current != last {
            return current;
        }
    }
}

/// Builds once, then again after every change, until Ctrl-C.
pub async fn run(settings: &Settings) -> Result<()> {
    let mut last = modified(&settings.input);
    tracing::info!(
        "Watching {} (every {:?}, Ctrl-C to stop)",
        settings.input.display(),
        settings.watch_interval
    );

    loop {
        match pipeline::run_build(settings).await {
            Ok(summary) => tracing::info!("Rebuilt {} files", summary.files.len()),
            Err(e) => tracing::error!("Build failed: {:#}", e),
        }

        tokio::select! {
            changed = wait_for_change(&settings.input, last, settings.watch_interval) => {
                tracing::info!("{} changed, rebuilding", settings.input.display());
                last = changed;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watcher");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "a").unwrap();
        let before = modified(&path);
        assert!(before.is_some());

        let touch = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let file = std::fs::File::options().write(true).open(&touch).unwrap();
            file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        });

        let after = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_change(&path, before, Duration::from_millis(10)),
        )
        .await
        .expect("change not detected");
        assert_ne!(after, before);
    }

    #[tokio::test]
    async fn deletion_counts_as_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "a").unwrap();
        let before = modified(&path);
        std::fs::remove_file(&path).unwrap();

        let after = wait_for_change(&path, before, Duration::from_millis(5)).await;
        assert!(after.is_none());
    }
}
