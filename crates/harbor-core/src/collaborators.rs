//! External collaborators
//!
//! Binary resolution, configuration-supplied environment overrides, and the
//! filesystem/search caches are owned elsewhere. The orchestrator only talks
//! to them through these traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Executable identity used to launch an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBinary {
    /// Absolute path, or a bare name to look up on `PATH`
    pub path: PathBuf,
    /// Display label
    pub label: String,
    /// Version, when known
    #[serde(default)]
    pub version: Option<String>,
}

/// Supplies the executable for new workspaces.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BinaryResolver: Send + Sync {
    /// Resolve the default instance binary.
    async fn resolve_default(&self) -> Result<ResolvedBinary>;
}

/// Resolver returning a fixed, configured binary.
#[derive(Debug, Clone)]
pub struct ConfiguredBinaryResolver {
    binary: ResolvedBinary,
}

impl ConfiguredBinaryResolver {
    /// Wrap a configured binary.
    pub fn new(binary: ResolvedBinary) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl BinaryResolver for ConfiguredBinaryResolver {
    async fn resolve_default(&self) -> Result<ResolvedBinary> {
        Ok(self.binary.clone())
    }
}

/// Environment overrides merged into every launched instance.
pub trait EnvironmentProvider: Send + Sync {
    /// Current overrides.
    fn environment(&self) -> HashMap<String, String>;
}

impl EnvironmentProvider for HashMap<String, String> {
    fn environment(&self) -> HashMap<String, String> {
        self.clone()
    }
}

/// Filesystem/search caches keyed by workspace root.
#[cfg_attr(test, mockall::automock)]
pub trait WorkspaceCacheInvalidator: Send + Sync {
    /// Drop cached state for `root`.
    fn invalidate(&self, root: &Path);
}

/// Invalidator for deployments without caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCacheInvalidator;

impl WorkspaceCacheInvalidator for NoopCacheInvalidator {
    fn invalidate(&self, _root: &Path) {}
}

/// Resolve a bare executable name (no path separators) against `PATH`.
///
/// Paths containing a separator are returned unchanged.
pub fn resolve_executable(binary: &Path) -> Result<PathBuf> {
    let is_bare = binary.components().count() == 1 && !binary.has_root();
    if !is_bare {
        return Ok(binary.to_path_buf());
    }

    which::which(binary).map_err(|e| Error::BinaryUnresolved {
        name: binary.display().to_string(),
        reason: e.to_string(),
    })
}
