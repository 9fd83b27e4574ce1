pub mod delta;
pub mod diff_cache;
pub mod fetch;
pub mod hashing;
pub mod paths;
pub mod registry;
pub mod signing;
pub mod source;

pub use delta::{BsdiffEngine, DiffEngine, DiffError, ZstdDiffEngine};
pub use diff_cache::{DiffCache, Patch};
pub use fetch::{AssetFetchCache, FetchError};
pub use hashing::FileHashCache;
pub use paths::*;
pub use registry::{Asset, RefreshSummary, RegistryError, ReleaseRegistry, UpdateGraph};
pub use signing::{ReleaseSigner, SigningError};
pub use source::{GithubReleaseSource, ReleaseSource, SourceError, StaticReleaseSource};

/// User Agent string for outbound requests
pub const USER_AGENT: &str = concat!("updraft-core/", env!("CARGO_PKG_VERSION"));
