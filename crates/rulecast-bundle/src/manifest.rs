//! Payload manifest.
//!
//! `manifest.json` is a JSON array of `{ "name", "size", "hash" }` records
//! sorted by name. It is always rebuilt from a directory scan, never
//! appended to, so it lists exactly the `*.js.b64` files present.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{BundleError, Result};
use crate::runner::PAYLOAD_SUFFIX;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One payload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name relative to the payload directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
}

/// Sorted list of payload records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

/// Differences between a manifest and a directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ManifestCheck {
    /// Listed but not on disk.
    pub missing: Vec<String>,
    /// On disk but not listed.
    pub extra: Vec<String>,
    /// Listed with a different size or hash.
    pub changed: Vec<String>,
    /// Listed more than once.
    pub duplicate: Vec<String>,
}

impl ManifestCheck {
    /// Returns true when manifest and directory agree.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.extra.is_empty()
            && self.changed.is_empty()
            && self.duplicate.is_empty()
    }
}

fn hash_file(path: &Path) -> Result<(u64, String)> {
    let bytes = std::fs::read(path)?;
    Ok((bytes.len() as u64, hex::encode(Sha256::digest(&bytes))))
}

impl Manifest {
    /// Builds a manifest from the `*.js.b64` files directly inside `dir`.
    pub fn scan(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(BundleError::MissingDir(dir.to_path_buf()));
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !entry.file_type().is_file() || !name.ends_with(PAYLOAD_SUFFIX) {
                continue;
            }
            let (size, hash) = hash_file(entry.path())?;
            entries.push(ManifestEntry {
                name: name.to_string(),
                size,
                hash,
            });
        }
        Ok(Self::from_entries(entries))
    }

    /// Creates a manifest, sorting and deduplicating by name.
    pub fn from_entries(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Self { entries }
    }

    /// Records, sorted by name.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Writes `manifest.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, self.to_json()?)?;
        tracing::info!("Wrote {} with {} payload(s)", path.display(), self.len());
        Ok(path)
    }

    /// Reads a manifest file as written, without sorting or deduplicating,
    /// so [`verify`](Self::verify) sees exactly what the loader page would.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&text)?;
        Ok(Self { entries })
    }

    /// Compares this manifest against the payloads in `dir`.
    pub fn verify(&self, dir: &Path) -> Result<ManifestCheck> {
        let actual: BTreeMap<String, ManifestEntry> = Manifest::scan(dir)?
            .entries
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        let mut check = ManifestCheck::default();
        let mut listed: BTreeMap<&str, &ManifestEntry> = BTreeMap::new();
        for entry in &self.entries {
            if listed.insert(entry.name.as_str(), entry).is_some()
                && !check.duplicate.contains(&entry.name)
            {
                check.duplicate.push(entry.name.clone());
            }
        }

        for (name, entry) in &listed {
            match actual.get(*name) {
                None => check.missing.push(name.to_string()),
                Some(found) if found != *entry => check.changed.push(name.to_string()),
                Some(_) => {}
            }
        }
        check.extra = actual
            .keys()
            .filter(|name| !listed.contains_key(name.as_str()))
            .cloned()
            .collect();
        Ok(check)
    }
}
