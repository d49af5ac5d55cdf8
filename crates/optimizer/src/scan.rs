use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;

use crate::asset::{Asset, AssetId, AssetStore};
use crate::registry::{derived_path, worth_serving, FileSystem, ResolutionRegistry, FULL_KEY};

/// What an asset is missing. Computed fresh on every call, never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GapReport {
    /// Configured variants with no generated file, in registry order
    pub missing_resolutions: Vec<String>,
    /// Variant name (or `"full"`) -> file that needs a derived artifact
    pub missing_derived: BTreeMap<String, PathBuf>,
}

impl GapReport {
    pub fn is_empty(&self) -> bool {
        self.missing_resolutions.is_empty() && self.missing_derived.is_empty()
    }
}

/// Population size plus how much of it still needs work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkCounts {
    pub total: u64,
    pub needing_work: u64,
}

/// Enumerates assets and computes per-asset gaps. Side-effect free.
#[derive(Clone)]
pub struct Scanner {
    store: Arc<dyn AssetStore>,
    registry: Arc<ResolutionRegistry>,
    fs: Arc<dyn FileSystem>,
}

impl Scanner {
    pub fn new(
        store: Arc<dyn AssetStore>,
        registry: Arc<ResolutionRegistry>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self { store, registry, fs }
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Ids ascending, so repeated pages over an unchanged population
    /// partition it without gaps or overlaps
    pub fn list_asset_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>> {
        self.store.list_ids(limit, offset)
    }

    pub fn count_assets(&self) -> Result<u64> {
        self.store.count()
    }

    /// Generated file for a variant, if metadata names one and it exists
    pub fn variant_path(&self, asset: &Asset, name: &str) -> Option<PathBuf> {
        asset
            .variant_path(name)
            .filter(|path| self.fs.exists(path))
            .cloned()
    }

    /// Gap report for an asset id; unknown or unreadable assets yield an empty report
    pub fn get_gaps(&self, id: AssetId) -> GapReport {
        match self.store.asset(id) {
            Ok(Some(asset)) => self.gaps_for(&asset),
            Ok(None) => {
                debug!("Asset {} not found in store", id);
                GapReport::default()
            }
            Err(e) => {
                warn!("Failed to read metadata for asset {}: {:#}", id, e);
                GapReport::default()
            }
        }
    }

    pub fn gaps_for(&self, asset: &Asset) -> GapReport {
        let mut report = GapReport::default();

        if !self.fs.exists(&asset.source) {
            debug!("Asset {} source missing: {}", asset.id, asset.source.display());
            return report;
        }

        let full_derived = derived_path(&asset.source);
        if !worth_serving(self.fs.as_ref(), &asset.source, &full_derived) {
            report.missing_derived.insert(FULL_KEY.to_string(), asset.source.clone());
        }

        for name in self.registry.names() {
            if asset.variants.is_none() {
                // nothing generated yet, so nothing to derive from either
                report.missing_resolutions.push(name);
                continue;
            }
            match self.variant_path(asset, &name) {
                Some(path) => {
                    let derived = derived_path(&path);
                    if !worth_serving(self.fs.as_ref(), &path, &derived) {
                        report.missing_derived.insert(name, path);
                    }
                }
                None => report.missing_resolutions.push(name),
            }
        }

        report
    }

    /// Walks the whole population. Expensive: for coarse status display only.
    pub fn get_counts_needing_work(&self) -> Result<WorkCounts> {
        let total = self.count_assets()?;
        let ids = self.list_asset_ids(usize::MAX, 0)?;
        let mut needing_work = 0;

        for (checked, id) in ids.iter().enumerate() {
            if checked > 0 && checked % 1000 == 0 {
                info!("Checked {} of {} assets for gaps...", checked, ids.len());
            }
            if !self.get_gaps(*id).is_empty() {
                needing_work += 1;
            }
        }

        Ok(WorkCounts { total, needing_work })
    }
}
