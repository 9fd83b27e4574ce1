//! Server configuration.
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! `UPDRAFT_*` environment variables, then command-line flags (applied by
//! the binary).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use updraft_core::{BsdiffEngine, DiffEngine, ReleaseSigner, ZstdDiffEngine};

/// Which diff engine produces patches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DiffEngineKind {
    /// External `bsdiff`/`bspatch` tools.
    #[default]
    Bsdiff,
    /// In-process zstd with the old file as dictionary.
    Zstd,
}

impl DiffEngineKind {
    /// Construct the engine. `timeout` bounds external tool invocations.
    pub fn build(self, timeout: Duration) -> Arc<dyn DiffEngine> {
        match self {
            Self::Bsdiff => Arc::new(BsdiffEngine::new(timeout)),
            Self::Zstd => Arc::new(ZstdDiffEngine::default()),
        }
    }
}

impl std::str::FromStr for DiffEngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bsdiff" => Ok(Self::Bsdiff),
            "zstd" => Ok(Self::Zstd),
            other => anyhow::bail!("unknown diff engine '{other}' (expected bsdiff or zstd)"),
        }
    }
}

/// GitHub repository whose releases are served.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Repository owner.
    #[serde(default)]
    pub owner: String,
    /// Repository name.
    #[serde(default)]
    pub repo: String,
    /// API token; raises rate limits and reaches private repositories.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// API root, for GitHub Enterprise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL clients use to reach this server; patch URLs are built on it.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Release source.
    #[serde(default)]
    pub github: GithubConfig,

    /// Cache root holding `assets/` and `patches/`. Defaults to
    /// `$UPDRAFT_HOME` or `~/.updraft`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Base64 Ed25519 secret key.
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,

    /// File holding a Base64 Ed25519 secret key.
    #[serde(default)]
    pub signing_key_file: Option<PathBuf>,

    /// Seconds between background refreshes of the release list.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    /// Asset download timeout in seconds.
    #[serde(default = "default_timeout")]
    pub download_timeout: u64,

    /// Patch generation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub diff_timeout: u64,

    /// Patch engine.
    #[serde(default)]
    pub engine: DiffEngineKind,

    /// Publish releases flagged as pre-release.
    #[serde(default)]
    pub include_prereleases: bool,

    /// Bearer token required by `POST /refresh`. Without one the endpoint
    /// rejects every call.
    #[serde(default, skip_serializing)]
    pub admin_token: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_refresh_interval() -> u64 {
    300 // 5 minutes
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_url: default_public_url(),
            github: GithubConfig::default(),
            cache_dir: None,
            signing_key: None,
            signing_key_file: None,
            refresh_interval: default_refresh_interval(),
            download_timeout: default_timeout(),
            diff_timeout: default_timeout(),
            engine: DiffEngineKind::default(),
            include_prereleases: false,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `UPDRAFT_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = var("UPDRAFT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(url) = var("UPDRAFT_PUBLIC_URL") {
            self.public_url = url;
        }
        if let Some(owner) = var("UPDRAFT_GITHUB_OWNER") {
            self.github.owner = owner;
        }
        if let Some(repo) = var("UPDRAFT_GITHUB_REPO") {
            self.github.repo = repo;
        }
        if let Some(token) = var("UPDRAFT_GITHUB_TOKEN").or_else(|| var("GITHUB_TOKEN")) {
            self.github.token = Some(token);
        }
        if let Some(key) = var("UPDRAFT_SIGNING_KEY") {
            self.signing_key = Some(key);
        }
        if let Some(path) = var("UPDRAFT_SIGNING_KEY_FILE") {
            self.signing_key_file = Some(PathBuf::from(path));
        }
        if let Some(secs) = var("UPDRAFT_REFRESH_INTERVAL") {
            self.refresh_interval = secs
                .parse()
                .context("UPDRAFT_REFRESH_INTERVAL must be a number of seconds")?;
        }
        if let Some(engine) = var("UPDRAFT_DIFF_ENGINE") {
            self.engine = engine.parse()?;
        }
        if let Some(flag) = var("UPDRAFT_INCLUDE_PRERELEASES") {
            self.include_prereleases = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(token) = var("UPDRAFT_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
            self.admin_token = Some(token);
        }
        Ok(())
    }

    /// Cache root, falling back to `$UPDRAFT_HOME` or `~/.updraft`.
    pub fn cache_root(&self) -> Result<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(updraft_core::try_updraft_home)
            .context("Could not determine a cache directory; set cache_dir or UPDRAFT_HOME")
    }

    /// Load the signing key from the inline value or the key file.
    pub fn signer(&self) -> Result<ReleaseSigner> {
        if let Some(key) = &self.signing_key {
            return ReleaseSigner::from_base64(key).context("Invalid signing key");
        }
        if let Some(path) = &self.signing_key_file {
            return ReleaseSigner::from_file(path).context("Invalid signing key file");
        }
        anyhow::bail!(
            "No signing key configured; set signing_key_file or UPDRAFT_SIGNING_KEY \
             (see `updraft keygen`)"
        )
    }

    /// Check the settings `serve` cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.github.owner.is_empty() || self.github.repo.is_empty() {
            anyhow::bail!("github.owner and github.repo are required");
        }
        if self.refresh_interval == 0 {
            anyhow::bail!("refresh_interval must be at least 1 second");
        }
        Ok(())
    }

    /// Public URL without a trailing slash.
    pub fn public_base(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    /// Get refresh interval as Duration.
    pub fn refresh_interval_duration(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    /// Get download timeout as Duration.
    pub fn download_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    /// Get diff timeout as Duration.
    pub fn diff_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.diff_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.engine, DiffEngineKind::Bsdiff);
        assert_eq!(config.download_timeout_duration(), Duration::from_secs(30));
        assert!(!config.include_prereleases);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_toml_fills_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("updraft.toml");
        std::fs::write(
            &path,
            r#"
public_url = "https://updates.example.com/"
engine = "zstd"

[github]
owner = "getlantern"
repo = "lantern"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.public_base(), "https://updates.example.com");
        assert_eq!(config.engine, DiffEngineKind::Zstd);
        assert_eq!(config.github.repo, "lantern");
        assert_eq!(config.refresh_interval, 300);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("UPDRAFT_GITHUB_OWNER", "acme"),
            ("UPDRAFT_GITHUB_REPO", "app"),
            ("GITHUB_TOKEN", "ghp_x"),
            ("UPDRAFT_DIFF_ENGINE", "ZSTD"),
            ("UPDRAFT_REFRESH_INTERVAL", "60"),
            ("UPDRAFT_INCLUDE_PRERELEASES", "true"),
            ("UPDRAFT_ADMIN_TOKEN", "s3cret"),
        ]);
        let mut config = ServerConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.github.owner, "acme");
        assert_eq!(config.github.token.as_deref(), Some("ghp_x"));
        assert_eq!(config.engine, DiffEngineKind::Zstd);
        assert_eq!(config.refresh_interval_duration(), Duration::from_secs(60));
        assert!(config.include_prereleases);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_bad_env_values_are_errors() {
        let mut config = ServerConfig::default();
        assert!(
            config
                .apply_vars(|name| (name == "UPDRAFT_REFRESH_INTERVAL").then(|| "soon".into()))
                .is_err()
        );
        assert!(
            config
                .apply_vars(|name| (name == "UPDRAFT_DIFF_ENGINE").then(|| "xdelta".into()))
                .is_err()
        );
    }

    #[test]
    fn test_signer_sources() {
        let signer = ReleaseSigner::generate();
        let mut config = ServerConfig::default();
        assert!(config.signer().is_err());

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("release.key");
        std::fs::write(&path, signer.secret_base64()).unwrap();
        config.signing_key_file = Some(path);
        assert_eq!(
            config.signer().unwrap().public_key_base64(),
            signer.public_key_base64()
        );

        config.signing_key = Some("garbage".into());
        assert!(config.signer().is_err());
    }
}
