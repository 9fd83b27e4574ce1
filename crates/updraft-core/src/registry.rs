//! The update graph and the registry that keeps it current.
//!
//! For every (platform, arch) pair the graph knows the latest asset and the
//! older ones still eligible for upgrade. A refresh rebuilds the whole graph
//! from the release source and publishes it with a single pointer swap, so
//! readers never block and never see a half-built graph. A failed refresh
//! leaves the previous graph in place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use updraft_schema::{Arch, Platform, ReleaseVersion, Sha256Digest, classify};

use crate::fetch::{AssetFetchCache, FetchError};
use crate::hashing::FileHashCache;
use crate::signing::{ReleaseSigner, checksum_for_file};
use crate::source::{ReleaseSource, SourceError};

/// Assets materialized concurrently during a refresh.
const MATERIALIZE_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Release source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to fetch asset: {0}")]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One published release artifact with its integrity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub platform: Platform,
    pub arch: Arch,
    pub version: ReleaseVersion,
    /// File name as published.
    pub name: String,
    pub url: String,
    /// SHA256 of the (decompressed) content.
    pub checksum: Sha256Digest,
    /// Bytes a full download transfers; the compressed size for compressed assets.
    pub size: u64,
    /// Base64 Ed25519 signature over `checksum`.
    pub signature: String,
}

type GraphKey = (Platform, Arch);

/// Immutable snapshot of known releases.
#[derive(Debug, Default)]
pub struct UpdateGraph {
    /// Non-latest assets per pair, ascending by version.
    eligible: HashMap<GraphKey, Vec<Arc<Asset>>>,
    latest: HashMap<GraphKey, Arc<Asset>>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl UpdateGraph {
    /// Build a graph from a flat list of assets. Versions must be unique
    /// per pair; the highest becomes the latest.
    pub fn from_assets(assets: Vec<Asset>, refreshed_at: DateTime<Utc>) -> Self {
        let mut grouped: HashMap<GraphKey, Vec<Arc<Asset>>> = HashMap::new();
        for asset in assets {
            grouped
                .entry((asset.platform, asset.arch))
                .or_default()
                .push(Arc::new(asset));
        }

        let mut eligible = HashMap::new();
        let mut latest = HashMap::new();
        for (key, mut list) in grouped {
            list.sort_by(|a, b| a.version.cmp(&b.version));
            if let Some(top) = list.pop() {
                latest.insert(key, top);
                eligible.insert(key, list);
            }
        }

        Self {
            eligible,
            latest,
            refreshed_at: Some(refreshed_at),
        }
    }

    /// The newest asset for the pair.
    pub fn latest(&self, platform: Platform, arch: Arch) -> Option<Arc<Asset>> {
        self.latest.get(&(platform, arch)).cloned()
    }

    /// Older assets for the pair, ascending. `None` when the pair is unknown;
    /// an empty list when only the latest exists.
    pub fn eligible(&self, platform: Platform, arch: Arch) -> Option<Vec<Arc<Asset>>> {
        self.eligible.get(&(platform, arch)).cloned()
    }

    /// The asset for an exact version of the pair, latest included.
    pub fn find(
        &self,
        platform: Platform,
        arch: Arch,
        version: &ReleaseVersion,
    ) -> Option<Arc<Asset>> {
        let key = (platform, arch);
        self.latest
            .get(&key)
            .filter(|a| &a.version == version)
            .or_else(|| {
                self.eligible
                    .get(&key)?
                    .iter()
                    .find(|a| &a.version == version)
            })
            .cloned()
    }

    /// The asset of the pair published at exactly `url`.
    pub fn find_by_url(&self, platform: Platform, arch: Arch, url: &str) -> Option<Arc<Asset>> {
        let key = (platform, arch);
        self.latest
            .get(&key)
            .into_iter()
            .chain(self.eligible.get(&key).into_iter().flatten())
            .find(|a| a.url == url)
            .cloned()
    }

    /// Every (platform, arch) pair with at least one asset.
    pub fn pairs(&self) -> impl Iterator<Item = (Platform, Arch)> + '_ {
        self.latest.keys().copied()
    }

    /// Total assets across all pairs.
    pub fn asset_count(&self) -> usize {
        self.latest.len() + self.eligible.values().map(Vec::len).sum::<usize>()
    }

    /// When this snapshot was built; `None` before the first refresh.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// Counts from one refresh, for logging and the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub releases: usize,
    pub assets: usize,
    pub skipped: usize,
    pub pairs: usize,
}

struct Candidate {
    platform: Platform,
    arch: Arch,
    version: ReleaseVersion,
    name: String,
    url: String,
}

/// Owns the update graph and rebuilds it from a [`ReleaseSource`].
#[derive(Debug)]
pub struct ReleaseRegistry {
    source: Arc<dyn ReleaseSource>,
    fetcher: Arc<AssetFetchCache>,
    hashes: Arc<FileHashCache>,
    signer: Arc<ReleaseSigner>,
    graph: ArcSwap<UpdateGraph>,
    include_prereleases: bool,
    writer: Mutex<()>,
}

impl ReleaseRegistry {
    /// Registry with an empty graph. Call [`refresh`](Self::refresh) to populate it.
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        fetcher: Arc<AssetFetchCache>,
        hashes: Arc<FileHashCache>,
        signer: Arc<ReleaseSigner>,
    ) -> Self {
        Self {
            source,
            fetcher,
            hashes,
            signer,
            graph: ArcSwap::from_pointee(UpdateGraph::default()),
            include_prereleases: false,
            writer: Mutex::new(()),
        }
    }

    /// Also publish releases marked as pre-release by the source.
    pub fn with_prereleases(mut self, include: bool) -> Self {
        self.include_prereleases = include;
        self
    }

    /// Current graph. Hold on to it for several lookups that must agree.
    pub fn snapshot(&self) -> Arc<UpdateGraph> {
        self.graph.load_full()
    }

    /// When the published graph was built; `None` before the first refresh.
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.graph.load().refreshed_at()
    }

    /// See [`UpdateGraph::latest`].
    pub fn latest(&self, platform: Platform, arch: Arch) -> Option<Arc<Asset>> {
        self.graph.load().latest(platform, arch)
    }

    /// See [`UpdateGraph::eligible`].
    pub fn eligible(&self, platform: Platform, arch: Arch) -> Option<Vec<Arc<Asset>>> {
        self.graph.load().eligible(platform, arch)
    }

    /// See [`UpdateGraph::find`].
    pub fn find(
        &self,
        platform: Platform,
        arch: Arch,
        version: &ReleaseVersion,
    ) -> Option<Arc<Asset>> {
        self.graph.load().find(platform, arch, version)
    }

    /// Rebuild the graph from the release source and publish it.
    ///
    /// Assets that cannot be classified, lack a usable version, duplicate an
    /// earlier (platform, arch, version) or cannot be fetched are skipped and
    /// logged; they never abort the refresh.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Source`] if the release list cannot be
    /// obtained. The previous graph stays published.
    pub async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let _writer = self.writer.lock().await;
        let releases = self.source.releases().await?;

        let mut summary = RefreshSummary {
            releases: releases.len(),
            ..RefreshSummary::default()
        };
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for release in &releases {
            if release.prerelease && !self.include_prereleases {
                debug!(tag = %release.tag_name, "skipping pre-release");
                summary.skipped += release.assets.len();
                continue;
            }

            for asset in &release.assets {
                let info = match classify(&asset.name) {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(asset = %asset.name, error = %e, "skipping unclassifiable asset");
                        summary.skipped += 1;
                        continue;
                    }
                };

                let version = if info.version.is_undetermined() {
                    match ReleaseVersion::parse(&release.tag_name) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(
                                asset = %asset.name,
                                tag = %release.tag_name,
                                error = %e,
                                "asset has no version and tag is not semver, skipping"
                            );
                            summary.skipped += 1;
                            continue;
                        }
                    }
                } else {
                    info.version
                };

                if !seen.insert((info.platform, info.arch, version.clone())) {
                    debug!(
                        asset = %asset.name,
                        %version,
                        "duplicate version for pair, keeping first"
                    );
                    summary.skipped += 1;
                    continue;
                }

                candidates.push(Candidate {
                    platform: info.platform,
                    arch: info.arch,
                    version,
                    name: asset.name.clone(),
                    url: asset.download_url.clone(),
                });
            }
        }

        let results: Vec<_> = futures::stream::iter(candidates)
            .map(|c| self.materialize(c))
            .buffer_unordered(MATERIALIZE_CONCURRENCY)
            .collect()
            .await;

        let mut assets = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(asset) => assets.push(asset),
                Err((name, e)) => {
                    warn!(asset = %name, error = %e, "failed to materialize asset, skipping");
                    summary.skipped += 1;
                }
            }
        }

        let graph = UpdateGraph::from_assets(assets, Utc::now());
        summary.assets = graph.asset_count();
        summary.pairs = graph.latest.len();
        self.graph.store(Arc::new(graph));

        info!(
            source = %self.source.key(),
            releases = summary.releases,
            assets = summary.assets,
            pairs = summary.pairs,
            skipped = summary.skipped,
            "update graph refreshed"
        );
        Ok(summary)
    }

    /// Download the asset and compute its checksum, transfer size and signature.
    async fn materialize(&self, c: Candidate) -> Result<Asset, (String, RegistryError)> {
        let inner = async {
            let local = self.fetcher.fetch(&c.url).await?;
            let checksum = checksum_for_file(&self.hashes, &local).await?;
            let size = self.fetcher.transfer_size(&c.url).await?;
            Ok::<_, RegistryError>((checksum, size))
        };
        let (checksum, size) = inner.await.map_err(|e| (c.name.clone(), e))?;
        let signature = self.signer.sign(&checksum);

        Ok(Asset {
            platform: c.platform,
            arch: c.arch,
            version: c.version,
            name: c.name,
            url: c.url,
            checksum,
            size,
            signature,
        })
    }

    /// Refresh every `every` in the background. Failures are logged and the
    /// previous graph keeps serving until the next tick.
    pub fn spawn_refresh_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already refreshed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "registry refresh failed, serving previous snapshot");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::DEFAULT_FETCH_TIMEOUT;
    use crate::source::{Release, ReleaseAsset, StaticReleaseSource};
    use async_trait::async_trait;
    use mockito::{Server, ServerGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn release(tag: &str, base: &str, names: &[&str]) -> Release {
        Release {
            tag_name: tag.to_string(),
            draft: false,
            prerelease: false,
            assets: names
                .iter()
                .map(|n| ReleaseAsset {
                    name: (*n).to_string(),
                    download_url: format!("{base}/{tag}/{n}"),
                })
                .collect(),
        }
    }

    /// Serves `body_for(path)` for every asset path in `releases`.
    async fn serve(server: &mut ServerGuard, releases: &[Release]) {
        for r in releases {
            for a in &r.assets {
                let path = a.download_url.trim_start_matches(&server.url()).to_string();
                server
                    .mock("GET", path.as_str())
                    .with_status(200)
                    .with_body(format!("content of {path}"))
                    .create_async()
                    .await;
            }
        }
    }

    fn registry(tmp: &std::path::Path, source: Arc<dyn ReleaseSource>) -> ReleaseRegistry {
        ReleaseRegistry::new(
            source,
            Arc::new(AssetFetchCache::new(tmp, DEFAULT_FETCH_TIMEOUT).unwrap()),
            Arc::new(FileHashCache::new()),
            Arc::new(ReleaseSigner::generate()),
        )
    }

    #[tokio::test]
    async fn test_refresh_builds_latest_and_eligible() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let releases = vec![
            release("v1.2.0", &base, &["app-linux-arm-1.2.0", "app-darwin-x64-1.2.0.dmg"]),
            release("v1.1.0", &base, &["app-linux-arm-1.1.0"]),
            release("v1.0.0", &base, &["app-linux-arm-1.0.0", "app-darwin-x64-1.0.0.dmg"]),
        ];
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::new(releases)));
        let summary = reg.refresh().await.unwrap();
        assert_eq!(summary.assets, 5);
        assert_eq!(summary.pairs, 2);
        assert_eq!(summary.skipped, 0);

        let latest = reg.latest(Platform::Linux, Arch::Arm).unwrap();
        assert_eq!(latest.version, ReleaseVersion::new(1, 2, 0));
        assert_eq!(
            latest.checksum,
            Sha256Digest::compute(b"content of /v1.2.0/app-linux-arm-1.2.0")
        );
        assert!(reg.signer.verify(&latest.checksum, &latest.signature));
        assert_eq!(latest.size, "content of /v1.2.0/app-linux-arm-1.2.0".len() as u64);

        let eligible: Vec<_> = reg
            .eligible(Platform::Linux, Arch::Arm)
            .unwrap()
            .iter()
            .map(|a| a.version.to_string())
            .collect();
        assert_eq!(eligible, ["1.0.0", "1.1.0"]);

        let darwin = reg.latest(Platform::Darwin, Arch::X64).unwrap();
        assert_eq!(darwin.name, "app-darwin-x64-1.2.0.dmg");
    }

    #[tokio::test]
    async fn test_unknown_pair_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::default()));
        reg.refresh().await.unwrap();

        assert!(reg.latest(Platform::Windows, Arch::X86).is_none());
        assert!(reg.eligible(Platform::Windows, Arch::X86).is_none());
        assert!(reg.last_refreshed().is_some());
    }

    #[tokio::test]
    async fn test_bad_assets_are_skipped_not_fatal() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let releases = vec![release(
            "v2.0.0",
            &base,
            &[
                "app-linux-x64",
                "app-osx-x64",
                "checksums.txt",
                "app-linux-x64-notaversion",
                "app-windows-x86",
            ],
        )];
        // Only serve the linux asset; the windows one 404s.
        server
            .mock("GET", "/v2.0.0/app-linux-x64")
            .with_status(200)
            .with_body("linux")
            .create_async()
            .await;
        server
            .mock("GET", "/v2.0.0/app-windows-x86")
            .with_status(404)
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::new(releases)));
        let summary = reg.refresh().await.unwrap();

        assert_eq!(summary.assets, 1);
        assert_eq!(summary.skipped, 4);
        // Version came from the tag.
        assert_eq!(
            reg.latest(Platform::Linux, Arch::X64).unwrap().version,
            ReleaseVersion::new(2, 0, 0)
        );
        assert!(reg.latest(Platform::Windows, Arch::X86).is_none());
    }

    #[tokio::test]
    async fn test_prereleases_are_opt_in() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let mut beta = release("v2.0.0-beta.1", &base, &["app-linux-x64"]);
        beta.prerelease = true;
        let releases = vec![beta, release("v1.0.0", &base, &["app-linux-x64"])];
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let source: Arc<dyn ReleaseSource> = Arc::new(StaticReleaseSource::new(releases));

        let stable = registry(tmp.path(), source.clone());
        stable.refresh().await.unwrap();
        assert_eq!(
            stable.latest(Platform::Linux, Arch::X64).unwrap().version,
            ReleaseVersion::new(1, 0, 0)
        );

        let eager = registry(tmp.path(), source).with_prereleases(true);
        eager.refresh().await.unwrap();
        assert_eq!(
            eager.latest(Platform::Linux, Arch::X64).unwrap().version,
            ReleaseVersion::parse("2.0.0-beta.1").unwrap()
        );
    }

    #[tokio::test]
    async fn test_latest_dominates_eligible() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let tags = [
            "0.9.0", "1.0.0-rc.1", "1.0.0", "1.10.0", "1.2.0", "1.9.9", "0.1.0",
        ];
        let releases: Vec<_> = tags
            .iter()
            .map(|t| {
                release(
                    &format!("v{t}"),
                    &base,
                    &["app-linux-arm", "app-windows-x64.exe"],
                )
            })
            .collect();
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::new(releases)));
        reg.refresh().await.unwrap();

        let graph = reg.snapshot();
        let pairs: Vec<_> = graph.pairs().collect();
        assert_eq!(pairs.len(), 2);
        for (platform, arch) in pairs {
            let latest = graph.latest(platform, arch).unwrap();
            assert_eq!(latest.version, ReleaseVersion::new(1, 10, 0));
            let eligible = graph.eligible(platform, arch).unwrap();
            assert_eq!(eligible.len(), tags.len() - 1);
            assert!(eligible.iter().all(|a| a.version < latest.version));
            assert!(eligible.windows(2).all(|w| w[0].version < w[1].version));
        }
    }

    #[tokio::test]
    async fn test_find_exact_version() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let releases = vec![
            release("v1.2.0", &base, &["app-linux-arm"]),
            release("v1.0.0", &base, &["app-linux-arm"]),
        ];
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::new(releases)));
        reg.refresh().await.unwrap();

        let old = reg
            .find(Platform::Linux, Arch::Arm, &ReleaseVersion::new(1, 0, 0))
            .unwrap();
        assert!(old.url.ends_with("/v1.0.0/app-linux-arm"));
        assert!(
            reg.find(Platform::Linux, Arch::Arm, &ReleaseVersion::new(1, 2, 0))
                .is_some()
        );
        assert!(
            reg.find(Platform::Linux, Arch::Arm, &ReleaseVersion::new(1, 1, 0))
                .is_none()
        );

        let graph = reg.snapshot();
        assert_eq!(
            graph
                .find_by_url(Platform::Linux, Arch::Arm, &old.url)
                .unwrap()
                .version,
            ReleaseVersion::new(1, 0, 0)
        );
        assert!(
            graph
                .find_by_url(Platform::Linux, Arch::Arm, "https://evil.example.com/x")
                .is_none()
        );
        assert!(graph.find_by_url(Platform::Linux, Arch::X64, &old.url).is_none());
    }

    /// Succeeds once, then fails.
    #[derive(Debug)]
    struct FlakySource {
        inner: StaticReleaseSource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReleaseSource for FlakySource {
        fn key(&self) -> String {
            "flaky".into()
        }

        async fn releases(&self) -> Result<Vec<Release>, SourceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.releases().await
            } else {
                Err(SourceError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    url: "https://api.example.com".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_graph() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let releases = vec![release("v1.0.0", &base, &["app-linux-x64"])];
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(
            tmp.path(),
            Arc::new(FlakySource {
                inner: StaticReleaseSource::new(releases),
                calls: AtomicUsize::new(0),
            }),
        );

        reg.refresh().await.unwrap();
        let before = reg.snapshot();
        assert!(reg.refresh().await.is_err());
        let after = reg.snapshot();

        assert!(Arc::ptr_eq(&before, &after));
        assert!(reg.latest(Platform::Linux, Arch::X64).is_some());
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot_across_refresh() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let releases = vec![release("v1.0.0", &base, &["app-linux-x64"])];
        serve(&mut server, &releases).await;

        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path(), Arc::new(StaticReleaseSource::new(releases)));
        let empty = reg.snapshot();
        reg.refresh().await.unwrap();

        assert_eq!(empty.asset_count(), 0);
        assert_eq!(reg.snapshot().asset_count(), 1);
    }
}
