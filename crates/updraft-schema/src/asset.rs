//! Classification of release asset file names.
//!
//! Asset names follow `<prefix>-<platform>-<arch>[-<version>][.<ext>]`, e.g.
//! `autoupdate-binary-linux-arm-1.2.0.tar.bz2`. The prefix may contain
//! dashes of its own, so the platform/arch pair is located by vocabulary
//! rather than by position.

use crate::platform::{Arch, Platform};
use crate::version::ReleaseVersion;

/// Packaging extensions stripped before the version suffix is parsed.
/// Compound extensions come before their tails.
pub const KNOWN_EXTENSIONS: &[&str] = &[
    ".tar.gz",
    ".tar.bz2",
    ".tar.zst",
    ".bz2",
    ".gz",
    ".zst",
    ".zip",
    ".dmg",
    ".pkg",
    ".exe",
    ".msi",
    ".deb",
    ".rpm",
    ".AppImage",
];

/// Errors produced by [`classify`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// A known architecture token was preceded by an unknown platform token.
    #[error("unrecognized platform '{0}'")]
    UnknownPlatform(String),

    /// A known platform token was followed by an unknown architecture token.
    #[error("unrecognized architecture '{0}'")]
    UnknownArch(String),

    /// No platform/architecture pair could be located at all.
    #[error("asset name '{0}' does not follow <prefix>-<platform>-<arch>[-<version>]")]
    Unrecognized(String),

    /// A version suffix was present but is not a semantic version.
    #[error("invalid version '{version}' in asset name: {reason}")]
    InvalidVersion {
        /// The offending suffix.
        version: String,
        /// Parser message.
        reason: String,
    },
}

/// Immutable classification result for one asset name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AssetInfo {
    /// Target operating system.
    pub platform: Platform,
    /// Target CPU architecture.
    pub arch: Arch,
    /// Version carried by the name, or [`ReleaseVersion::Undetermined`].
    pub version: ReleaseVersion,
}

/// Strip one known packaging extension from `name`, if present.
pub fn strip_extension(name: &str) -> &str {
    KNOWN_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
}

/// Architecture token at `idx`. The last token may carry a trailing
/// `.ext` (e.g. `x64.v1`), which is not part of the token.
fn arch_token<'a>(tokens: &[&'a str], idx: usize) -> &'a str {
    let token = tokens[idx];
    if idx + 1 == tokens.len() {
        token.split('.').next().unwrap_or(token)
    } else {
        token
    }
}

/// Classify an asset file name into platform, architecture and version.
///
/// # Errors
///
/// Returns [`ClassifyError`] if the platform or architecture token is not in
/// the fixed vocabulary, or if a version suffix is present but malformed.
/// Tokens are never guessed: `osx` is not `darwin`.
///
/// # Example
///
/// ```
/// use updraft_schema::{Arch, Platform, ReleaseVersion, classify};
///
/// let info = classify("autoupdate-binary-linux-arm-1.2.0.tar.bz2").unwrap();
/// assert_eq!(info.platform, Platform::Linux);
/// assert_eq!(info.arch, Arch::Arm);
/// assert_eq!(info.version, ReleaseVersion::new(1, 2, 0));
///
/// assert!(classify("autoupdate-binary-osx-x86").is_err());
/// ```
pub fn classify(name: &str) -> Result<AssetInfo, ClassifyError> {
    let stem = strip_extension(name);
    let tokens: Vec<&str> = stem.split('-').collect();

    // Index 0 is always prefix; the pair needs two more tokens.
    let pairs = 1..tokens.len().saturating_sub(1);

    for i in pairs.clone() {
        let (Some(platform), Some(arch)) = (
            Platform::from_token(tokens[i]),
            Arch::from_token(arch_token(&tokens, i + 1)),
        ) else {
            continue;
        };

        let rest = tokens[i + 2..].join("-");
        let version = if rest.is_empty() {
            ReleaseVersion::Undetermined
        } else {
            ReleaseVersion::parse(&rest).map_err(|e| ClassifyError::InvalidVersion {
                version: rest.clone(),
                reason: e.to_string(),
            })?
        };

        return Ok(AssetInfo {
            platform,
            arch,
            version,
        });
    }

    for i in pairs {
        let arch = arch_token(&tokens, i + 1);
        if Arch::from_token(arch).is_some() {
            return Err(ClassifyError::UnknownPlatform(tokens[i].to_string()));
        }
        if Platform::from_token(tokens[i]).is_some() {
            return Err(ClassifyError::UnknownArch(arch.to_string()));
        }
    }

    Err(ClassifyError::Unrecognized(name.to_string()))
}
