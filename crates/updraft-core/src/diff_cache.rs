//! Content-addressed cache of binary patches.
//!
//! A patch is named after the ordered pair of its inputs' content hashes, so
//! it is generated once and then reused by every request for the same
//! upgrade path, regardless of which URLs the inputs came from.
//!
//! Generation is serialized behind a single process-wide lock. The guard
//! travels into the blocking task, so a generation that outlives its timeout
//! still holds the lock until it actually stops.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};
use updraft_schema::{Blake3Hash, Sha256Digest};

use crate::delta::{DiffEngine, DiffError};
use crate::fetch::AssetFetchCache;
use crate::hashing::FileHashCache;

/// Default bound on a single diff or patch invocation.
pub const DEFAULT_DIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// A generated patch and the local files it relates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Cache key: BLAKE3 of `(source hash, target hash)`.
    pub key: Blake3Hash,
    pub source_file: PathBuf,
    pub target_file: PathBuf,
    pub patch_file: PathBuf,
}

impl Patch {
    /// File name of the patch inside the patches directory.
    pub fn file_name(&self) -> String {
        format!("{}.patch", self.key)
    }

    /// Patch size in bytes.
    pub fn size(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.patch_file)?.len())
    }
}

/// Order-sensitive cache key for a patch from `old` to `new`.
pub fn patch_key(old: &Sha256Digest, new: &Sha256Digest) -> Blake3Hash {
    Blake3Hash::compute_parts(&[old.as_str().as_bytes(), new.as_str().as_bytes()])
}

#[derive(Debug)]
pub struct DiffCache {
    fetcher: Arc<AssetFetchCache>,
    hashes: Arc<FileHashCache>,
    engine: Arc<dyn DiffEngine>,
    dir: PathBuf,
    timeout: Duration,
    generation: Arc<Mutex<()>>,
}

impl DiffCache {
    /// Cache writing patches into `dir` using `engine`.
    pub fn new(
        fetcher: Arc<AssetFetchCache>,
        hashes: Arc<FileHashCache>,
        engine: Arc<dyn DiffEngine>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            hashes,
            engine,
            dir: dir.into(),
            timeout: DEFAULT_DIFF_TIMEOUT,
            generation: Arc::new(Mutex::new(())),
        }
    }

    /// Override the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the underlying engine, used as the wire patch type.
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Directory holding generated patches.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the patch for `key` lives.
    pub fn patch_path(&self, key: &Blake3Hash) -> PathBuf {
        self.dir.join(format!("{key}.patch"))
    }

    /// Patch turning the asset at `old_url` into the asset at `new_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError`] if either asset cannot be fetched or hashed, or
    /// if the engine fails or times out. Failures are not retried.
    pub async fn get_or_create_patch(
        &self,
        old_url: &str,
        new_url: &str,
    ) -> Result<Patch, DiffError> {
        let (source, target) =
            tokio::try_join!(self.fetcher.fetch(old_url), self.fetcher.fetch(new_url))?;
        self.get_or_create_patch_for_files(source, target).await
    }

    /// Same as [`get_or_create_patch`](Self::get_or_create_patch) for files
    /// that are already local.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError`] if either input is missing or unreadable, or if
    /// the engine fails or times out.
    pub async fn get_or_create_patch_for_files(
        &self,
        source_file: PathBuf,
        target_file: PathBuf,
    ) -> Result<Patch, DiffError> {
        for input in [&source_file, &target_file] {
            if !tokio::fs::try_exists(input).await? {
                return Err(DiffError::MissingInput(input.clone()));
            }
        }

        let old_hash = self.hashes.digest(&source_file).await?;
        let new_hash = self.hashes.digest(&target_file).await?;
        let key = patch_key(&old_hash, &new_hash);
        let patch = Patch {
            patch_file: self.patch_path(&key),
            key,
            source_file,
            target_file,
        };

        if tokio::fs::try_exists(&patch.patch_file).await? {
            debug!(key = %patch.key, "patch cache hit");
            return Ok(patch);
        }

        let guard = Arc::clone(&self.generation).lock_owned().await;

        // Whoever held the lock before us may have produced this very patch.
        if tokio::fs::try_exists(&patch.patch_file).await? {
            debug!(key = %patch.key, "patch generated while waiting");
            return Ok(patch);
        }

        info!(
            key = %patch.key,
            engine = self.engine.name(),
            from = %old_hash,
            to = %new_hash,
            "generating patch"
        );
        let started = Instant::now();

        let engine = Arc::clone(&self.engine);
        let dir = self.dir.clone();
        let (source, target, dest) = (
            patch.source_file.clone(),
            patch.target_file.clone(),
            patch.patch_file.clone(),
        );
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let staged = tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(&dir)?
                .into_temp_path();
            engine.diff(&source, &target, &staged)?;
            staged.persist(&dest).map_err(|e| e.error)?;
            Ok::<(), DiffError>(())
        });

        run_bounded(task, self.engine.name(), self.timeout).await?;

        info!(
            key = %patch.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "patch ready"
        );
        Ok(patch)
    }

    /// Reconstruct `out_file` from `old_file` and `patch_file`.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError::MissingInput`] if either input is absent, or the
    /// engine's error if application fails. `out_file` is only written on
    /// success.
    pub async fn apply(
        &self,
        old_file: &Path,
        patch_file: &Path,
        out_file: &Path,
    ) -> Result<PathBuf, DiffError> {
        apply_patch(
            Arc::clone(&self.engine),
            old_file,
            patch_file,
            out_file,
            self.timeout,
        )
        .await
    }
}

/// Rebuild `out_file` from `old_file` and `patch_file` with `engine`.
///
/// The result is staged next to `out_file` and renamed into place only on
/// success, so a failed or timed-out application leaves `out_file` untouched.
///
/// # Errors
///
/// Returns [`DiffError::MissingInput`] if either input is absent,
/// [`DiffError::Timeout`] after `timeout`, or the engine's error.
pub async fn apply_patch(
    engine: Arc<dyn DiffEngine>,
    old_file: &Path,
    patch_file: &Path,
    out_file: &Path,
    timeout: Duration,
) -> Result<PathBuf, DiffError> {
    for input in [old_file, patch_file] {
        if !tokio::fs::try_exists(input).await? {
            return Err(DiffError::MissingInput(input.to_path_buf()));
        }
    }

    let name = engine.name();
    let (old, patch, out) = (
        old_file.to_path_buf(),
        patch_file.to_path_buf(),
        out_file.to_path_buf(),
    );
    let task = tokio::task::spawn_blocking(move || {
        let parent = out
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staged = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(parent)?
            .into_temp_path();
        engine.apply(&old, &patch, &staged)?;
        staged.persist(&out).map_err(|e| e.error)?;
        Ok::<(), DiffError>(())
    });

    run_bounded(task, name, timeout).await?;
    Ok(out_file.to_path_buf())
}

async fn run_bounded(
    task: tokio::task::JoinHandle<Result<(), DiffError>>,
    name: &str,
    timeout: Duration,
) -> Result<(), DiffError> {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(DiffError::Aborted(join.to_string())),
        Err(_) => Err(DiffError::Timeout(name.to_string(), timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::ZstdDiffEngine;
    use crate::fetch::DEFAULT_FETCH_TIMEOUT;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine that records how it is called. The "patch" is a copy of the
    /// new file, which is enough to exercise the cache.
    #[derive(Debug, Default)]
    struct RecordingEngine {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl DiffEngine for RecordingEngine {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn diff(&self, _old: &Path, new: &Path, patch: &Path) -> Result<(), DiffError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(DiffError::ToolFailed {
                    tool: "recording".into(),
                    status: "exit status: 1".into(),
                    stderr: String::new(),
                });
            }
            std::fs::copy(new, patch)?;
            Ok(())
        }

        fn apply(&self, _old: &Path, patch: &Path, new: &Path) -> Result<(), DiffError> {
            std::fs::copy(patch, new)?;
            Ok(())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        cache: DiffCache,
    }

    impl Fixture {
        fn new(engine: Arc<dyn DiffEngine>) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let assets = tmp.path().join("assets");
            let patches = tmp.path().join("patches");
            std::fs::create_dir_all(&assets).unwrap();
            std::fs::create_dir_all(&patches).unwrap();
            let fetcher = Arc::new(AssetFetchCache::new(&assets, DEFAULT_FETCH_TIMEOUT).unwrap());
            let cache = DiffCache::new(fetcher, Arc::new(FileHashCache::new()), engine, &patches);
            Self { tmp, cache }
        }

        fn file(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.tmp.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }
    }

    #[test]
    fn test_patch_key_is_order_sensitive() {
        let a = Sha256Digest::compute(b"a");
        let b = Sha256Digest::compute(b"b");
        assert_ne!(patch_key(&a, &b), patch_key(&b, &a));
        assert_eq!(patch_key(&a, &b), patch_key(&a, &b));
    }

    #[tokio::test]
    async fn test_second_request_is_a_cache_hit() {
        let engine = Arc::new(RecordingEngine::default());
        let fx = Fixture::new(engine.clone());
        let old = fx.file("old", b"old");
        let new = fx.file("new", b"new");

        let first = fx
            .cache
            .get_or_create_patch_for_files(old.clone(), new.clone())
            .await
            .unwrap();
        let second = fx.cache.get_or_create_patch_for_files(old, new).await.unwrap();

        assert_eq!(first.patch_file, second.patch_file);
        assert!(first.patch_file.exists());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reverse_pair_is_a_different_patch() {
        let engine = Arc::new(RecordingEngine::default());
        let fx = Fixture::new(engine.clone());
        let a = fx.file("a", b"aaaa");
        let b = fx.file("b", b"bbbb");

        let forward = fx
            .cache
            .get_or_create_patch_for_files(a.clone(), b.clone())
            .await
            .unwrap();
        let backward = fx.cache.get_or_create_patch_for_files(b, a).await.unwrap();

        assert_ne!(forward.key, backward.key);
        assert_ne!(forward.patch_file, backward.patch_file);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_follows_content_not_path() {
        let engine = Arc::new(RecordingEngine::default());
        let fx = Fixture::new(engine.clone());
        let old1 = fx.file("old1", b"same old");
        let old2 = fx.file("old2", b"same old");
        let new = fx.file("new", b"new");

        let p1 = fx
            .cache
            .get_or_create_patch_for_files(old1, new.clone())
            .await
            .unwrap();
        let p2 = fx.cache.get_or_create_patch_for_files(old2, new).await.unwrap();
        assert_eq!(p1.key, p2.key);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_generate_once() {
        let engine = Arc::new(RecordingEngine {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let fx = Fixture::new(engine.clone());
        let old = fx.file("old", b"old");
        let new = fx.file("new", b"new");

        let (a, b, c) = tokio::join!(
            fx.cache.get_or_create_patch_for_files(old.clone(), new.clone()),
            fx.cache.get_or_create_patch_for_files(old.clone(), new.clone()),
            fx.cache.get_or_create_patch_for_files(old, new),
        );
        assert_eq!(a.unwrap().patch_file, b.unwrap().patch_file);
        assert!(c.is_ok());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_generation_is_serialized_across_pairs() {
        let engine = Arc::new(RecordingEngine {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let fx = Fixture::new(engine.clone());
        let files: Vec<PathBuf> = (0..4)
            .map(|i| fx.file(&format!("f{i}"), format!("content {i}").as_bytes()))
            .collect();

        let (a, b, c) = tokio::join!(
            fx.cache.get_or_create_patch_for_files(files[0].clone(), files[1].clone()),
            fx.cache.get_or_create_patch_for_files(files[1].clone(), files[2].clone()),
            fx.cache.get_or_create_patch_for_files(files[2].clone(), files[3].clone()),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_no_patch() {
        let engine = Arc::new(RecordingEngine {
            fail: true,
            ..Default::default()
        });
        let fx = Fixture::new(engine.clone());
        let old = fx.file("old", b"old");
        let new = fx.file("new", b"new");

        let err = fx
            .cache
            .get_or_create_patch_for_files(old.clone(), new.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::ToolFailed { .. }));
        assert_eq!(std::fs::read_dir(fx.cache.dir()).unwrap().count(), 0);

        // Not cached as a failure either: the next request tries again.
        assert!(fx.cache.get_or_create_patch_for_files(old, new).await.is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let engine = Arc::new(RecordingEngine {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let Fixture { tmp, cache } = Fixture::new(engine);
        let cache = cache.with_timeout(Duration::from_millis(50));
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();

        let err = cache.get_or_create_patch_for_files(old, new).await.unwrap_err();
        assert!(matches!(err, DiffError::Timeout(..)));
    }

    #[tokio::test]
    async fn test_missing_input() {
        let fx = Fixture::new(Arc::new(RecordingEngine::default()));
        let old = fx.file("old", b"old");
        let err = fx
            .cache
            .get_or_create_patch_for_files(old, fx.tmp.path().join("gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::MissingInput(_)));

        let dir = fx.tmp.path();
        let err = fx
            .cache
            .apply(&dir.join("gone"), &dir.join("p"), &dir.join("o"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_output_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old");
        let patch = tmp.path().join("patch");
        let out = tmp.path().join("out");
        std::fs::write(&old, b"old bytes").unwrap();
        std::fs::write(&patch, b"not a zstd frame").unwrap();
        std::fs::write(&out, b"previous build").unwrap();

        let err = apply_patch(
            Arc::new(ZstdDiffEngine::default()),
            &old,
            &patch,
            &out,
            DEFAULT_DIFF_TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiffError::Io(_)), "{err:?}");
        assert_eq!(std::fs::read(&out).unwrap(), b"previous build");

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".partial-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_urls_roundtrip_with_zstd() {
        let old_bytes: Vec<u8> = (0..20_000u32).flat_map(u32::to_be_bytes).collect();
        let mut new_bytes = old_bytes.clone();
        new_bytes.extend_from_slice(b"release notes: fixed everything");

        let mut server = mockito::Server::new_async().await;
        let m_old = server
            .mock("GET", "/app-linux-arm-1.0.0")
            .with_status(200)
            .with_body(old_bytes.clone())
            .expect(1)
            .create_async()
            .await;
        let m_new = server
            .mock("GET", "/app-linux-arm-1.2.0")
            .with_status(200)
            .with_body(new_bytes.clone())
            .expect(1)
            .create_async()
            .await;

        let fx = Fixture::new(Arc::new(ZstdDiffEngine::default()));
        let old_url = format!("{}/app-linux-arm-1.0.0", server.url());
        let new_url = format!("{}/app-linux-arm-1.2.0", server.url());

        let patch = fx.cache.get_or_create_patch(&old_url, &new_url).await.unwrap();
        let again = fx.cache.get_or_create_patch(&old_url, &new_url).await.unwrap();
        assert_eq!(patch, again);
        assert!(patch.size().unwrap() < new_bytes.len() as u64);

        let out = fx.tmp.path().join("rebuilt");
        fx.cache
            .apply(&patch.source_file, &patch.patch_file, &out)
            .await
            .unwrap();
        assert_eq!(
            Sha256Digest::compute_file(&out).unwrap(),
            Sha256Digest::compute(&new_bytes)
        );
        assert_ne!(
            Sha256Digest::compute_file(&out).unwrap(),
            Sha256Digest::compute(&old_bytes)
        );

        m_old.assert_async().await;
        m_new.assert_async().await;
    }
}
