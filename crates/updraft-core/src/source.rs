//! Release sources: where the list of published releases comes from.

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// GitHub's maximum page size for the releases endpoint.
const PAGE_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid header value: {0}")]
    Header(#[from] header::InvalidHeaderValue),

    #[error("GitHub API error: {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
}

/// One published release.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub assets: Vec<ReleaseAsset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

/// A remote source that can list published releases (e.g. GitHub).
#[async_trait]
pub trait ReleaseSource: Send + Sync + std::fmt::Debug {
    /// Unique identifier for this source instance (e.g. "github:owner/repo")
    fn key(&self) -> String;

    /// Fetch every release, newest first as the source orders them.
    async fn releases(&self) -> Result<Vec<Release>, SourceError>;
}

/// Build a GitHub client, authenticated when a token is given.
///
/// # Errors
///
/// Returns an error if the token is not a valid header value or the client
/// cannot be built.
pub fn build_github_client(token: Option<&str>) -> Result<Client, SourceError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/vnd.github+json"),
    );

    if let Some(t) = token {
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {t}"))?,
        );
    }

    Ok(Client::builder()
        .user_agent(crate::USER_AGENT)
        .default_headers(headers)
        .timeout(crate::fetch::DEFAULT_FETCH_TIMEOUT)
        .build()?)
}

/// Releases of one GitHub repository.
#[derive(Debug, Clone)]
pub struct GithubReleaseSource {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
}

impl GithubReleaseSource {
    /// Source for `owner/repo` on api.github.com.
    pub fn new(client: Client, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            client,
            api_base: "https://api.github.com".to_string(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Point at a different API root (GitHub Enterprise, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    fn key(&self) -> String {
        format!("github:{}/{}", self.owner, self.repo)
    }

    async fn releases(&self) -> Result<Vec<Release>, SourceError> {
        let mut all = Vec::new();

        for page in 1.. {
            let url = format!(
                "{}/repos/{}/{}/releases?per_page={PAGE_SIZE}&page={page}",
                self.api_base, self.owner, self.repo
            );
            let resp = self.client.get(&url).send().await?;
            if !resp.status().is_success() {
                return Err(SourceError::Status {
                    status: resp.status(),
                    url,
                });
            }

            let batch: Vec<Release> = resp.json().await?;
            let len = batch.len();
            debug!(page, releases = len, "fetched release page");
            all.extend(batch.into_iter().filter(|r| !r.draft));

            if len < PAGE_SIZE {
                break;
            }
        }

        Ok(all)
    }
}

/// A fixed list of releases.
#[derive(Debug, Clone, Default)]
pub struct StaticReleaseSource {
    releases: Vec<Release>,
}

impl StaticReleaseSource {
    /// Serve `releases` on every call.
    pub fn new(releases: Vec<Release>) -> Self {
        Self { releases }
    }
}

#[async_trait]
impl ReleaseSource for StaticReleaseSource {
    fn key(&self) -> String {
        "static".to_string()
    }

    async fn releases(&self) -> Result<Vec<Release>, SourceError> {
        Ok(self.releases.clone())
    }
}
