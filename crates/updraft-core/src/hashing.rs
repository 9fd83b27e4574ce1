use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use updraft_schema::Sha256Digest;

/// Memoized SHA256 digests of local files, keyed by path.
///
/// Every path handed to this cache is content-addressed (assets are named
/// after their URL, patches after their inputs), so a path never changes
/// content once written and entries never go stale. Hashing itself runs on
/// the blocking pool without holding the lock.
#[derive(Debug, Default)]
pub struct FileHashCache {
    entries: Mutex<HashMap<PathBuf, Sha256Digest>>,
}

impl FileHashCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of the file at `path`, computed at most once per path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read.
    pub async fn digest(&self, path: &Path) -> io::Result<Sha256Digest> {
        if let Some(hit) = self.entries.lock().await.get(path) {
            return Ok(hit.clone());
        }

        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || Sha256Digest::compute_file(&owned))
            .await
            .map_err(io::Error::other)??;

        // Two concurrent misses compute the same value; keep whichever landed first.
        Ok(self
            .entries
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_insert(digest)
            .clone())
    }

    /// Look up a digest without computing it.
    pub async fn get(&self, path: &Path) -> Option<Sha256Digest> {
        self.entries.lock().await.get(path).cloned()
    }

    /// Forget the digest for `path`, e.g. after discarding a corrupt cache file.
    pub async fn invalidate(&self, path: &Path) {
        self.entries.lock().await.remove(path);
    }

    /// Number of memoized entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when nothing has been hashed yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn digest_is_memoized() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("asset");
        std::fs::write(&path, b"version one").unwrap();

        let cache = FileHashCache::new();
        let first = cache.digest(&path).await.unwrap();
        assert_eq!(first, Sha256Digest::compute(b"version one"));

        // Paths are assumed immutable, so a rewrite is not noticed...
        std::fs::write(&path, b"version two").unwrap();
        assert_eq!(cache.digest(&path).await.unwrap(), first);
        assert_eq!(cache.len().await, 1);

        // ...until the entry is invalidated.
        cache.invalidate(&path).await;
        assert_eq!(
            cache.digest(&path).await.unwrap(),
            Sha256Digest::compute(b"version two")
        );
    }

    #[tokio::test]
    async fn missing_file_is_an_error_and_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileHashCache::new();
        let missing = tmp.path().join("nope");

        assert!(cache.digest(&missing).await.is_err());
        assert!(cache.get(&missing).await.is_none());
        assert!(cache.is_empty().await);
    }
}
