//! The update decision: given what a client runs, what should it download?

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};
use updraft_core::{DiffCache, DiffError, ReleaseRegistry};
use updraft_schema::compare;

use crate::protocol::{PATCH_TYPE_NONE, UpdateQuery, UpdateResponse};

/// Outcome of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// The client is current, ahead, or on a platform with no releases.
    NoUpdate,
    /// A newer release is available.
    Update(UpdateResponse),
}

/// Answers update checks from the registry and the patch cache.
#[derive(Debug, Clone)]
pub struct UpdateService {
    registry: Arc<ReleaseRegistry>,
    diffs: Arc<DiffCache>,
    public_url: String,
}

impl UpdateService {
    /// Service building patch URLs under `public_url`.
    pub fn new(
        registry: Arc<ReleaseRegistry>,
        diffs: Arc<DiffCache>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            diffs,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The registry this service reads from.
    pub fn registry(&self) -> &Arc<ReleaseRegistry> {
        &self.registry
    }

    /// Decide what `query`'s client should do.
    ///
    /// `url` is always the full target asset. A patch is offered next to it
    /// only when it is smaller than that download. Patch generation problems
    /// never surface here; the client simply gets no patch. Checksum and
    /// signature always describe the full target binary, which is what the
    /// client verifies after patching.
    pub async fn check(&self, query: &UpdateQuery) -> UpdateDecision {
        // One snapshot so every lookup below sees the same graph.
        let graph = self.registry.snapshot();

        let Some(latest) = graph.latest(query.platform, query.arch) else {
            debug!(platform = %query.platform, arch = %query.arch, "no releases for platform");
            return UpdateDecision::NoUpdate;
        };

        if compare(&query.current, &latest.version) != Ordering::Less {
            debug!(current = %query.current, latest = %latest.version, "client is up to date");
            return UpdateDecision::NoUpdate;
        }

        // Client-supplied URLs are only trusted if they name a known asset.
        let current = query
            .asset_url
            .as_deref()
            .and_then(|url| graph.find_by_url(query.platform, query.arch, url))
            .or_else(|| graph.find(query.platform, query.arch, &query.current));

        let mut patch_url = None;
        let mut patch_type = PATCH_TYPE_NONE.to_string();

        if let Some(current) = current {
            match self.patch_url(&current.url, &latest.url, latest.size).await {
                Ok(Some(url)) => {
                    patch_url = Some(url);
                    patch_type = self.diffs.engine_name().to_string();
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        from = %current.version,
                        to = %latest.version,
                        error = %e,
                        "patch generation failed, offering full asset"
                    );
                }
            }
        }

        UpdateDecision::Update(UpdateResponse {
            url: latest.url.clone(),
            patch_url,
            patch_type,
            version: latest.version.to_string(),
            checksum: latest.checksum.to_string(),
            signature: latest.signature.clone(),
        })
    }

    /// Public URL of a patch from `old_url` to `new_url`, or `None` when
    /// the patch is no smaller than the `target_size` bytes of a full download.
    async fn patch_url(
        &self,
        old_url: &str,
        new_url: &str,
        target_size: u64,
    ) -> Result<Option<String>, DiffError> {
        if old_url == new_url {
            return Ok(None);
        }

        let patch = self.diffs.get_or_create_patch(old_url, new_url).await?;
        let patch_size = patch.size()?;
        if patch_size >= target_size {
            debug!(key = %patch.key, patch_size, target_size, "patch not smaller than target");
            return Ok(None);
        }

        Ok(Some(format!("{}/patches/{}", self.public_url, patch.file_name())))
    }
}
