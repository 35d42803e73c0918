//! Engine profile directory management
//!
//! Each Chromium instance gets a unique UUID-named user-data directory so
//! concurrent instances never contend on a SingletonLock. Directories are
//! removed on drop unless ownership is handed to the engine wrapper.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// RAII wrapper for an engine profile directory
///
/// Cleans up the directory on drop unless `into_path()` transfers ownership
/// to another cleanup mechanism.
#[derive(Debug)]
pub struct EngineProfile {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl EngineProfile {
    /// Create a fresh profile directory under the system temp dir
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(prefix: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{prefix}_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create profile directory {}", path.display()))?;
        debug!(path = %path.display(), "created engine profile directory");
        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the profile and return the path, disabling auto-cleanup
    pub fn into_path(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for EngineProfile {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to clean up profile directory"
                );
            }
        }
    }
}

/// Remove a profile directory that outlived its engine
///
/// Blocking remove, callable from Drop contexts where async is unavailable.
pub fn remove_profile_dir(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(
            path = %path.display(),
            error = %e,
            "failed to remove engine profile directory, manual cleanup may be required"
        );
    }
}
