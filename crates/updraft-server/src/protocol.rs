//! Wire types of the update-check protocol.
//!
//! Field aliases accept the names used by go-update style clients
//! (`app_version`, `os`) alongside the native ones.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use updraft_schema::{Arch, Platform, ReleaseVersion};

/// Wire value of `patch_type` when the full asset is offered.
pub const PATCH_TYPE_NONE: &str = "none";

/// Errors from validating an [`UpdateRequest`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Platform token outside the supported vocabulary.
    #[error("unsupported platform '{0}'")]
    Platform(String),

    /// Architecture token outside the supported vocabulary.
    #[error("unsupported architecture '{0}'")]
    Arch(String),

    /// Current version is not a semantic version.
    #[error("invalid version '{version}': {reason}")]
    Version {
        /// The rejected input.
        version: String,
        /// Parser message.
        reason: String,
    },
}

/// Body of `POST /update`, as sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Application identifier; informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Version the client is running.
    #[serde(alias = "app_version")]
    pub version: String,
    /// Operating system token (`darwin`, `linux`, `windows`).
    #[serde(alias = "os")]
    pub platform: String,
    /// Architecture token (`x86`, `x64`, `arm`, `arm64`).
    pub arch: String,
    /// URL of the asset the client was installed from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_url: Option<String>,
}

/// A validated update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateQuery {
    /// Requesting platform.
    pub platform: Platform,
    /// Requesting architecture.
    pub arch: Arch,
    /// Version currently installed.
    pub current: ReleaseVersion,
    /// Client-supplied URL of its current asset.
    pub asset_url: Option<String>,
}

impl TryFrom<UpdateRequest> for UpdateQuery {
    type Error = ProtocolError;

    fn try_from(req: UpdateRequest) -> Result<Self, Self::Error> {
        let platform =
            Platform::from_token(&req.platform).ok_or(ProtocolError::Platform(req.platform))?;
        let arch = Arch::from_token(&req.arch).ok_or(ProtocolError::Arch(req.arch))?;
        let current =
            ReleaseVersion::parse(&req.version).map_err(|e| ProtocolError::Version {
                version: req.version.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            platform,
            arch,
            current,
            asset_url: req.asset_url.filter(|u| !u.is_empty()),
        })
    }
}

/// Body of a positive update-check answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// The full target asset. Clients fall back to it when a patch fails.
    pub url: String,
    /// Patch from the client's version, when one is worth downloading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_url: Option<String>,
    /// `"none"` without a patch, else the engine that made the patch.
    pub patch_type: String,
    /// Version the client will be running after applying the update.
    pub version: String,
    /// Hex SHA256 of the full target binary.
    pub checksum: String,
    /// Base64 Ed25519 signature over the target checksum.
    pub signature: String,
}

impl UpdateResponse {
    /// Whether a patch is offered alongside the full asset.
    pub fn is_patch(&self) -> bool {
        self.patch_url.is_some()
    }
}
