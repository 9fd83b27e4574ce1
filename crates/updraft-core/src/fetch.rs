//! Download-once cache for remote release assets.
//!
//! Each URL maps to a deterministic local file,
//! `<assets>/<basename[..60]>.<sha256(url)>`, which is downloaded on first
//! use and never again. Single-stream compressed payloads (`.bz2`, `.gz`,
//! `.zst`) are stored decompressed, so hashes and diffs see the real binary.
//! Their compressed size is recorded next to them in `<local name>.size`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, ZstdDecoder};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::paths::filename_from_url;

/// Longest basename kept in a local file name. The `.` and 64-char URL
/// hash bring the total to 125, well under the usual 255-byte limit.
pub const MAX_BASENAME_LEN: usize = 60;

/// Default whole-request timeout for asset downloads.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Expecting 200 OK, got {status} for {url}")]
    Status { status: StatusCode, url: String },
}

/// Transport compression recognised from the URL's basename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Bzip2,
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect a single-stream compressed payload. Tarballs (`.tar.gz` etc.)
    /// are bundles rather than compressed binaries and are stored as-is.
    pub fn from_url(url: &str) -> Option<Self> {
        let name = filename_from_url(url);
        if name.contains(".tar.") {
            return None;
        }
        if name.ends_with(".bz2") {
            Some(Self::Bzip2)
        } else if name.ends_with(".gz") {
            Some(Self::Gzip)
        } else if name.ends_with(".zst") {
            Some(Self::Zstd)
        } else {
            None
        }
    }
}

/// Deterministic local file name for `url`.
pub fn local_name(url: &str) -> String {
    let mut basename = filename_from_url(url);
    if basename.is_empty() {
        basename = "asset";
    }
    if basename.len() > MAX_BASENAME_LEN {
        let mut end = MAX_BASENAME_LEN;
        while !basename.is_char_boundary(end) {
            end -= 1;
        }
        basename = &basename[..end];
    }
    format!("{basename}.{}", hex::encode(Sha256::digest(url.as_bytes())))
}

/// Downloads each asset URL exactly once into a local directory.
#[derive(Debug)]
pub struct AssetFetchCache {
    client: Client,
    dir: PathBuf,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AssetFetchCache {
    /// Cache storing files in `dir`, with a client that gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, dir))
    }

    /// Cache using a preconfigured client.
    pub fn with_client(client: Client, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding cached assets.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `url` is (or will be) stored.
    pub fn local_path(&self, url: &str) -> PathBuf {
        self.dir.join(local_name(url))
    }

    /// Where the compressed size of `url` is recorded.
    fn size_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.size", local_name(url)))
    }

    async fn is_cached(&self, url: &str, dest: &Path) -> Result<bool, FetchError> {
        if !tokio::fs::try_exists(dest).await? {
            return Ok(false);
        }
        if Compression::from_url(url).is_none() {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.size_path(url)).await?)
    }

    /// Bytes a client receives when it downloads `url` itself.
    ///
    /// For compressed payloads this is the compressed size, not the size of
    /// the decompressed file in the cache. Downloads `url` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the asset cannot be fetched or its size
    /// record is unreadable.
    pub async fn transfer_size(&self, url: &str) -> Result<u64, FetchError> {
        let dest = self.fetch(url).await?;
        if Compression::from_url(url).is_none() {
            return Ok(tokio::fs::metadata(&dest).await?.len());
        }

        let recorded = tokio::fs::read_to_string(self.size_path(url)).await?;
        recorded.trim().parse().map_err(|_| {
            FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt size record for {url}"),
            ))
        })
    }

    /// Local path of `url`'s content, downloading it if this is the first request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on network failure, a non-200 response, or a
    /// local I/O failure. Nothing is left in the cache on failure.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf, FetchError> {
        let dest = self.local_path(url);
        if self.is_cached(url, &dest).await? {
            return Ok(dest);
        }

        let lock = self
            .in_flight
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another task may have finished the download while we waited.
        if self.is_cached(url, &dest).await? {
            return Ok(dest);
        }

        let result = self.download(url, &dest).await;
        self.in_flight.lock().await.remove(url);
        result.map(|()| dest)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        debug!(url, dest = %dest.display(), "downloading asset");

        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        let stream = response.bytes_stream().map(move |r| {
            if let Ok(chunk) = &r {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            r.map_err(std::io::Error::other)
        });
        let body = StreamReader::new(stream);
        let compression = Compression::from_url(url);
        let mut reader: Pin<Box<dyn AsyncRead + Send>> = match compression {
            Some(Compression::Bzip2) => Box::pin(BzDecoder::new(body)),
            Some(Compression::Gzip) => Box::pin(GzipDecoder::new(body)),
            Some(Compression::Zstd) => Box::pin(ZstdDecoder::new(body)),
            None => Box::pin(body),
        };

        // Stage next to the destination so the final rename is atomic.
        let (std_file, tmp_path) = tempfile::NamedTempFile::new_in(&self.dir)?.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        if compression.is_some() {
            let size = received.load(Ordering::Relaxed);
            tokio::fs::write(self.size_path(url), size.to_string()).await?;
        }
        tmp_path.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}
