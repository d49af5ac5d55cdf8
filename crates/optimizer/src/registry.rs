//! Derived-artifact naming and serving policy, plus the process-wide
//! registry of configured resolution variants.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use log::{debug, warn};

use crate::config::ResolutionSpec;

/// Extension of every derived artifact
pub const DERIVED_EXTENSION: &str = "webp";

/// Gap-report key for the original (full-size) image
pub const FULL_KEY: &str = "full";

/// Derived artifacts up to 105% of the source size are still served
const TOLERANCE_PERCENT: u128 = 105;

/// Read-only view of the filesystem used by gap analysis.
///
/// Lets the scanner be exercised against an in-memory fake.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    /// Size in bytes, or None when it cannot be determined
    fn size(&self, path: &Path) -> Option<u64>;
}

/// The real, local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path).ok().map(|m| m.len())
    }
}

/// Sibling path of the derived artifact for a source or variant file.
///
/// `a/b/photo.jpeg` -> `a/b/photo.webp`, `noext` -> `noext.webp`.
pub fn derived_path(source: &Path) -> PathBuf {
    source.with_extension(DERIVED_EXTENSION)
}

/// Size check behind [`worth_serving`]; inclusive 5% tolerance.
pub fn within_tolerance(source_bytes: u64, derived_bytes: u64) -> bool {
    (derived_bytes as u128) * 100 <= (source_bytes as u128) * TOLERANCE_PERCENT
}

/// Whether an existing derived artifact should be served instead of its source.
///
/// Missing artifact => false. Unknown size of either file => true.
pub fn worth_serving(fs: &dyn FileSystem, source: &Path, derived: &Path) -> bool {
    if !fs.exists(derived) {
        return false;
    }
    match (fs.size(source), fs.size(derived)) {
        (Some(source_bytes), Some(derived_bytes)) => within_tolerance(source_bytes, derived_bytes),
        _ => true,
    }
}

/// Process-wide cache of the configured resolution variants.
///
/// Read-mostly; a configuration change replaces the whole list rather than
/// patching it.
pub struct ResolutionRegistry {
    source: RwLock<Vec<ResolutionSpec>>,
    cache: RwLock<Option<Arc<[ResolutionSpec]>>>,
}

impl ResolutionRegistry {
    pub fn new(specs: Vec<ResolutionSpec>) -> Self {
        Self {
            source: RwLock::new(specs),
            cache: RwLock::new(None),
        }
    }

    /// Configured variants, duplicates removed (first definition wins)
    pub fn specs(&self) -> Arc<[ResolutionSpec]> {
        if let Some(cached) = self.cache.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return cached.clone();
        }

        let source = self.source.read().unwrap_or_else(|e| e.into_inner());
        let mut unique: Vec<ResolutionSpec> = Vec::with_capacity(source.len());
        for spec in source.iter() {
            if unique.iter().any(|s| s.name == spec.name) {
                warn!("Ignoring duplicate resolution definition: {}", spec.name);
                continue;
            }
            unique.push(spec.clone());
        }
        let specs: Arc<[ResolutionSpec]> = unique.into();
        debug!("Resolution registry loaded {} variant(s)", specs.len());

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(specs.clone());
        specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs().iter().map(|s| s.name.clone()).collect()
    }

    /// Drop the cached list; the next read rebuilds it
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Swap in a new configured list (e.g. after a config reload)
    pub fn replace(&self, specs: Vec<ResolutionSpec>) {
        *self.source.write().unwrap_or_else(|e| e.into_inner()) = specs;
        self.invalidate();
    }
}
