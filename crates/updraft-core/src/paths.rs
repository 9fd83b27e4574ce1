use dirs::home_dir;
use std::io;
use std::path::{Path, PathBuf};

/// Returns the updraft home directory, or None if the user's home cannot be resolved.
///
/// `UPDRAFT_HOME` takes precedence over `~/.updraft`.
pub fn try_updraft_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("UPDRAFT_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".updraft"))
}

/// On-disk cache layout. Both directories are pure caches: deleting them
/// only costs a re-download or a re-diff.
#[derive(Debug, Clone)]
pub struct CacheDirs {
    root: PathBuf,
}

impl CacheDirs {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory of the layout.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn create(&self) -> io::Result<()> {
        for dir in [self.assets(), self.patches()] {
            std::fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Downloaded assets: `<root>/assets`
    pub fn assets(&self) -> PathBuf {
        self.root.join("assets")
    }

    /// Generated patches: `<root>/patches`
    pub fn patches(&self) -> PathBuf {
        self.root.join("patches")
    }
}

/// Extract the filename from a URL, ignoring any query string.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}
