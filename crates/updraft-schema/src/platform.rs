//! Closed platform and architecture vocabularies.

/// Target operating system of a release asset.
///
/// The vocabulary is closed: asset names are matched against the exact,
/// lowercase token returned by [`Platform::as_str`]. Anything else
/// (`osx`, `macos`, `Linux`) is rejected rather than guessed.
///
/// # Example
///
/// ```
/// use updraft_schema::Platform;
///
/// assert_eq!(Platform::from_token("linux"), Some(Platform::Linux));
/// assert_eq!(Platform::from_token("osx"), None);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// macOS.
    Darwin,
    /// Linux.
    Linux,
    /// Windows.
    Windows,
}

impl Platform {
    /// Every known platform, in declaration order.
    pub const ALL: [Platform; 3] = [Self::Darwin, Self::Linux, Self::Windows];

    /// Convert to the token used in asset names and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }

    /// Exact, case-sensitive token match.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == token)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| format!("Unknown platform: {s}"))
    }
}

/// Target CPU architecture of a release asset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86 (`x86_64` / amd64).
    X64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM (aarch64).
    Arm64,
}

impl Arch {
    /// Every known architecture, in declaration order.
    pub const ALL: [Arch; 4] = [Self::X86, Self::X64, Self::Arm, Self::Arm64];

    /// Convert to the token used in asset names and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }

    /// Exact, case-sensitive token match.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == token)
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| format!("Unknown architecture: {s}"))
    }
}
