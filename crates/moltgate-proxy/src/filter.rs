//! Reload-aware holder for the active allowlist.
//!
//! Checks run against an immutable snapshot; a reload builds the new
//! allowlist off to the side and swaps the `Arc` under a write lock, so
//! in-flight checks see either the old or the new config, never a torn
//! read. A failed reload leaves the previous config in place; enforcement
//! is never abandoned.

use crate::error::Result;
use moltgate::Allowlist;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Shared handle to the active allowlist.
pub struct AllowlistHandle {
    path: PathBuf,
    current: RwLock<Arc<Allowlist>>,
}

impl AllowlistHandle {
    /// Load the allowlist from `path` and return a handle bound to it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let allowlist = Allowlist::load(&path)?;
        info!(
            "Loaded allowlist from {} ({} domains)",
            path.display(),
            allowlist.len()
        );
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(allowlist)),
        })
    }

    /// The current snapshot. Cheap; callers keep it for the whole request.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Allowlist> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Re-read the file and swap the active config. On failure the previous
    /// config stays active and the error is returned for logging.
    pub fn reload(&self) -> Result<usize> {
        let fresh = Allowlist::load(&self.path)?;
        let count = fresh.len();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        info!("Reloaded allowlist ({} domains)", count);
        Ok(count)
    }

    /// Path the handle reloads from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
