//! Application state shared across request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;
use updraft_core::source::build_github_client;
use updraft_core::{
    AssetFetchCache, CacheDirs, DiffCache, FileHashCache, GithubReleaseSource, ReleaseRegistry,
};

use crate::config::ServerConfig;
use crate::service::UpdateService;

/// Application state shared across request handlers.
#[derive(Debug)]
pub struct AppState {
    /// Server configuration.
    pub config: ServerConfig,
    /// Update decision logic.
    pub service: UpdateService,
    /// Directory served under `/patches`.
    pub patches_dir: PathBuf,
    /// Process start time.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire up the release source, caches and signer described by `config`.
    ///
    /// The registry starts empty; the caller decides when to refresh it.
    /// Failing to create the cache directories is fatal.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let dirs = CacheDirs::new(config.cache_root()?);
        dirs.create().with_context(|| {
            format!(
                "Failed to create cache directories under {}",
                dirs.root().display()
            )
        })?;
        info!(cache = %dirs.root().display(), engine = ?config.engine, "cache ready");

        if config.admin_token.is_none() {
            info!("no admin token configured, POST /refresh is disabled");
        }

        let signer = Arc::new(config.signer()?);
        info!(public_key = %signer.public_key_base64(), "release signing key loaded");

        let client = build_github_client(config.github.token.as_deref())?;
        let mut source = GithubReleaseSource::new(
            client,
            config.github.owner.clone(),
            config.github.repo.clone(),
        );
        if let Some(base) = &config.github.api_base {
            source = source.with_api_base(base.clone());
        }

        let fetcher = Arc::new(AssetFetchCache::new(
            dirs.assets(),
            config.download_timeout_duration(),
        )?);
        let hashes = Arc::new(FileHashCache::new());
        let registry = Arc::new(
            ReleaseRegistry::new(
                Arc::new(source),
                Arc::clone(&fetcher),
                Arc::clone(&hashes),
                signer,
            )
            .with_prereleases(config.include_prereleases),
        );

        let engine = config.engine.build(config.diff_timeout_duration());
        let diffs = Arc::new(
            DiffCache::new(fetcher, hashes, engine, dirs.patches())
                .with_timeout(config.diff_timeout_duration()),
        );

        let service = UpdateService::new(registry, diffs, config.public_base());
        Ok(Self::from_service(config, service, dirs.patches()))
    }

    /// State around an already-built service.
    pub fn from_service(
        config: ServerConfig,
        service: UpdateService,
        patches_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            service,
            patches_dir,
            started_at: Utc::now(),
        }
    }

    /// The release registry behind the service.
    pub fn registry(&self) -> &Arc<ReleaseRegistry> {
        self.service.registry()
    }
}
