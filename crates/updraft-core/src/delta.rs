//! Binary diff/patch capabilities.
//!
//! A [`DiffEngine`] turns two files into a patch and back. Engines are
//! blocking and are driven from the blocking pool by
//! [`DiffCache`](crate::diff_cache::DiffCache); any non-success outcome is a
//! hard error and nothing they wrote is trusted.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;
use zstd::dict::DecoderDictionary;
use zstd::dict::EncoderDictionary;

use crate::fetch::FetchError;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("File {0} does not exist")]
    MissingInput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{0}' not found. Install it or pick another diff engine")]
    ToolNotFound(String),

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Failed to fetch asset: {0}")]
    Fetch(#[from] FetchError),

    #[error("Diff task aborted: {0}")]
    Aborted(String),
}

/// A capability that produces and applies binary patches.
pub trait DiffEngine: Send + Sync + std::fmt::Debug {
    /// Short identifier sent to clients as the patch type (e.g. `bsdiff`).
    fn name(&self) -> &'static str;

    /// Write a patch transforming `old` into `new` to `patch`.
    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<(), DiffError>;

    /// Reconstruct `new` from `old` and `patch`.
    fn apply(&self, old: &Path, patch: &Path, new: &Path) -> Result<(), DiffError>;
}

fn ensure_exists(path: &Path) -> Result<(), DiffError> {
    if path.exists() {
        Ok(())
    } else {
        Err(DiffError::MissingInput(path.to_path_buf()))
    }
}

/// Shells out to `bsdiff` / `bspatch`.
#[derive(Debug, Clone)]
pub struct BsdiffEngine {
    diff_tool: String,
    patch_tool: String,
    timeout: Duration,
}

impl Default for BsdiffEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl BsdiffEngine {
    /// Use `bsdiff` and `bspatch` from `PATH`, killing either after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self::with_tools("bsdiff", "bspatch", timeout)
    }

    /// Use explicit tool paths. Both take `old new patch` arguments.
    pub fn with_tools(
        diff_tool: impl Into<String>,
        patch_tool: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            diff_tool: diff_tool.into(),
            patch_tool: patch_tool.into(),
            timeout,
        }
    }

    fn run(&self, tool: &str, args: [&Path; 3]) -> Result<(), DiffError> {
        // Tools may write more to stderr than a pipe buffers.
        let mut stderr_file = tempfile::tempfile()?;
        let mut child = match Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file.try_clone()?))
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiffError::ToolNotFound(tool.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(status) = child.wait_timeout(self.timeout)? else {
            child.kill().ok();
            child.wait().ok();
            return Err(DiffError::Timeout(tool.to_string(), self.timeout));
        };

        if !status.success() {
            let mut raw = Vec::new();
            stderr_file.seek(SeekFrom::Start(0))?;
            stderr_file.read_to_end(&mut raw)?;
            let stderr = String::from_utf8_lossy(&raw);
            return Err(DiffError::ToolFailed {
                tool: tool.to_string(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl DiffEngine for BsdiffEngine {
    fn name(&self) -> &'static str {
        "bsdiff"
    }

    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<(), DiffError> {
        ensure_exists(old)?;
        ensure_exists(new)?;
        self.run(&self.diff_tool, [old, new, patch])
    }

    fn apply(&self, old: &Path, patch: &Path, new: &Path) -> Result<(), DiffError> {
        ensure_exists(old)?;
        ensure_exists(patch)?;
        // bspatch argument order is old, new, patch.
        self.run(&self.patch_tool, [old, new, patch])
    }
}

/// In-process deltas using zstd dictionary compression.
#[derive(Debug, Clone)]
pub struct ZstdDiffEngine {
    level: i32,
}

impl Default for ZstdDiffEngine {
    fn default() -> Self {
        Self { level: 19 }
    }
}

impl ZstdDiffEngine {
    /// Engine compressing at `level` (1-22).
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl DiffEngine for ZstdDiffEngine {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn diff(&self, old: &Path, new: &Path, patch: &Path) -> Result<(), DiffError> {
        ensure_exists(old)?;
        ensure_exists(new)?;
        let delta = generate_delta(&std::fs::read(old)?, &std::fs::read(new)?, self.level)?;
        std::fs::write(patch, delta)?;
        Ok(())
    }

    fn apply(&self, old: &Path, patch: &Path, new: &Path) -> Result<(), DiffError> {
        ensure_exists(old)?;
        ensure_exists(patch)?;
        let rebuilt = apply_delta(&std::fs::read(old)?, &std::fs::read(patch)?)?;
        std::fs::write(new, rebuilt)?;
        Ok(())
    }
}

/// Generate a binary delta using zstd dictionary compression.
/// The `old_data` serves as the dictionary for compressing `new_data`.
pub fn generate_delta(
    old_data: &[u8],
    new_data: &[u8],
    compression_level: i32,
) -> std::io::Result<Vec<u8>> {
    let dict = EncoderDictionary::copy(old_data, compression_level);
    let mut encoder = zstd::stream::Encoder::with_prepared_dictionary(Vec::new(), &dict)?;
    encoder.write_all(new_data)?;
    encoder.finish()
}

/// Apply a binary delta using zstd dictionary decompression.
/// The `old_data` is the same dictionary used during generation.
pub fn apply_delta(old_data: &[u8], patch_data: &[u8]) -> std::io::Result<Vec<u8>> {
    let dict = DecoderDictionary::copy(old_data);
    let mut decoder = zstd::stream::Decoder::with_prepared_dictionary(patch_data, &dict)?;
    let mut decompressed = Vec::new();
    std::io::copy(&mut decoder, &mut decompressed)?;
    Ok(decompressed)
}
