//! Empty-output guard.
//!
//! Runs last: required files must exist and be non-empty, and no file
//! anywhere under the output tree may be zero bytes.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::GuardError;

/// Checks a finished output directory.
#[derive(Debug, Clone, Default)]
pub struct OutputGuard {
    required: Vec<PathBuf>,
    skip_dirs: Vec<String>,
}

impl OutputGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file (relative to the output directory) that must be non-empty.
    pub fn require(mut self, relative: impl Into<PathBuf>) -> Self {
        self.required.push(relative.into());
        self
    }

    /// Adds several required files.
    pub fn require_all<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.required.extend(files.into_iter().map(Into::into));
        self
    }

    /// Excludes a directory name from the zero-byte scan.
    pub fn skip_dir(mut self, name: impl Into<String>) -> Self {
        self.skip_dirs.push(name.into());
        self
    }

    /// Returns the number of files scanned.
    pub fn check(&self, dir: &Path) -> Result<usize, GuardError> {
        if !dir.is_dir() {
            return Err(GuardError::MissingDir(dir.to_path_buf()));
        }

        let mut missing = Vec::new();
        let mut empty = Vec::new();
        for relative in &self.required {
            let path = dir.join(relative);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {}
                Ok(meta) if meta.is_file() => empty.push(path),
                _ => missing.push(path),
            }
        }

        let mut scanned = 0;
        let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| self.skip_dirs.iter().any(|s| s == name)))
        });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            scanned += 1;
            if entry.metadata()?.len() == 0 && !empty.iter().any(|p| p == entry.path()) {
                empty.push(entry.path().to_path_buf());
            }
        }

        if missing.is_empty() && empty.is_empty() {
            tracing::info!("Output validation passed ({} files)", scanned);
            Ok(scanned)
        } else {
            for path in &missing {
                tracing::error!("Missing required output: {}", path.display());
            }
            for path in &empty {
                tracing::error!("Empty output file: {}", path.display());
            }
            Err(GuardError::Failed { missing, empty })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        dir
    }

    #[test]
    fn passes_when_everything_has_content() {
        let dir = out_dir(&[("a.conf", "x"), ("web/m.json", "[]")]);
        let scanned = OutputGuard::new().require("a.conf").check(dir.path()).unwrap();
        assert_eq!(scanned, 2);
    }

    #[test]
    fn missing_required_file_fails() {
        let dir = out_dir(&[("a.conf", "x")]);
        let err = OutputGuard::new()
            .require_all(["a.conf", "b.conf"])
            .check(dir.path())
            .unwrap_err();
        match err {
            GuardError::Failed { missing, empty } => {
                assert_eq!(missing.len(), 1);
                assert!(missing[0].ends_with("b.conf"));
                assert!(empty.is_empty());
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn zero_byte_file_anywhere_fails() {
        let dir = out_dir(&[("a.conf", "x"), ("web/p.js.b64", "")]);
        let err = OutputGuard::new().require("a.conf").check(dir.path()).unwrap_err();
        assert!(err.to_string().contains("1 empty"));
        assert!(err.to_string().contains("p.js.b64"));
    }

    #[test]
    fn empty_required_file_reported_once() {
        let dir = out_dir(&[("a.conf", "")]);
        let err = OutputGuard::new().require("a.conf").check(dir.path()).unwrap_err();
        match err {
            GuardError::Failed { empty, .. } => assert_eq!(empty.len(), 1),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn skipped_dirs_are_not_scanned() {
        let dir = out_dir(&[("a.conf", "x"), (".cache/tmp", "")]);
        OutputGuard::new().skip_dir(".cache").check(dir.path()).unwrap();
    }

    #[test]
    fn missing_directory() {
        let err = OutputGuard::new()
            .check(Path::new("/nonexistent/rulecast-out"))
            .unwrap_err();
        assert!(matches!(err, GuardError::MissingDir(_)));
    }
}
