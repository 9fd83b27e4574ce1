//! Shared types for updraft: release asset classification, versions and
//! content digests.
//!
//! Everything here is pure: no I/O beyond hashing a local file.

pub mod asset;
pub mod hash;
pub mod platform;
pub mod version;

// Re-exports
pub use asset::{AssetInfo, ClassifyError, classify};
pub use hash::*;
pub use platform::*;
pub use version::{ReleaseVersion, compare};
