//! Content-addressed build cache.
//!
//! Entries are keyed by `sha256(fingerprint || 0x00 || source)` so a change to
//! either the payload or the obfuscator settings misses.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;

/// On-disk cache of encoded payloads.
#[derive(Debug, Clone)]
pub struct BuildCache {
    dir: PathBuf,
}

impl BuildCache {
    /// Opens (and creates) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Cache root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Computes the cache key for a source under an obfuscator fingerprint.
    pub fn key(fingerprint: &str, source: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_bytes());
        hasher.update([0u8]);
        hasher.update(source);
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("00");
        self.dir.join(shard).join(key)
    }

    /// Returns the cached bytes, if any.
    pub async fn load(&self, key: &str) -> Option<Vec<u8>> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Stores bytes under `key`; the write is atomic per entry.
    pub async fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_fingerprint_and_source() {
        let a = BuildCache::key("tool-1", b"src");
        assert_eq!(a.len(), 64);
        assert_eq!(a, BuildCache::key("tool-1", b"src"));
        assert_ne!(a, BuildCache::key("tool-2", b"src"));
        assert_ne!(a, BuildCache::key("tool-1", b"src2"));
        // The separator keeps "ab"+"c" and "a"+"bc" apart.
        assert_ne!(BuildCache::key("ab", b"c"), BuildCache::key("a", b"bc"));
    }

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::open(dir.path().join("cache")).unwrap();
        let key = BuildCache::key("fp", b"x");

        assert!(cache.load(&key).await.is_none());
        cache.store(&key, b"encoded").await.unwrap();
        assert_eq!(cache.load(&key).await.as_deref(), Some(&b"encoded"[..]));
        assert!(cache.dir().join(&key[..2]).join(&key).is_file());
    }
}
