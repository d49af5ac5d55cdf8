use std::collections::BTreeMap;
use std::path::PathBuf;
use anyhow::Result;

/// Opaque asset identifier; the population is ordered by it
pub type AssetId = u64;

/// A stored image and the resolution variants generated for it so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    /// Absolute path of the original image
    pub source: PathBuf,
    /// Variant name -> absolute path. `None` when the asset has no variant
    /// metadata at all (never generated, or unreadable).
    pub variants: Option<BTreeMap<String, PathBuf>>,
}

impl Asset {
    /// Recorded path for a variant, if the metadata knows about one
    pub fn variant_path(&self, name: &str) -> Option<&PathBuf> {
        self.variants.as_ref().and_then(|v| v.get(name))
    }
}

/// Asset metadata store.
///
/// Reads must reflect regeneration immediately: `asset(id)` after a
/// successful `regenerate_variants(id)` returns the new variants.
pub trait AssetStore: Send + Sync {
    /// Ids in ascending order, `limit` of them starting at `offset`
    fn list_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>>;

    fn count(&self) -> Result<u64>;

    fn asset(&self, id: AssetId) -> Result<Option<Asset>>;

    /// Produce the missing resolution variants for an asset
    fn regenerate_variants(&self, id: AssetId) -> Result<()>;
}
