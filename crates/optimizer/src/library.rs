//! Manifest-backed asset metadata store.
//!
//! Every registered image has a record in a JSON manifest holding its path
//! (relative to the library root) and, once generated, its resolution
//! variants stored as basenames next to the original.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::asset::{Asset, AssetId, AssetStore};
use crate::config::{OptimizerConfig, ResolutionSpec};
use crate::registry::ResolutionRegistry;
use crate::state::write_json_atomic;

/// Source image extensions picked up by ingest (lowercase)
pub const SOURCE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    next_id: AssetId,
    #[serde(default)]
    assets: BTreeMap<AssetId, AssetRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssetRecord {
    /// Relative to the library root
    file: PathBuf,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metadata: Option<VariantMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariantMetadata {
    width: u32,
    height: u32,
    #[serde(default)]
    sizes: BTreeMap<String, VariantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariantRecord {
    /// Basename, in the same directory as the original
    file: String,
    width: u32,
    height: u32,
}

/// Modification time plus length of the manifest file
type FileStamp = Option<(SystemTime, u64)>;

struct CachedManifest {
    stamp: FileStamp,
    manifest: Manifest,
}

pub struct ManifestLibrary {
    root: PathBuf,
    manifest_path: PathBuf,
    registry: Arc<ResolutionRegistry>,
    cache: Mutex<Option<CachedManifest>>,
}

impl ManifestLibrary {
    pub fn new(root: PathBuf, manifest_path: PathBuf, registry: Arc<ResolutionRegistry>) -> Self {
        Self {
            root,
            manifest_path,
            registry,
            cache: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &OptimizerConfig, registry: Arc<ResolutionRegistry>) -> Self {
        Self::new(cfg.library_root.clone(), cfg.resolved_manifest_path(), registry)
    }

    fn manifest_stamp(&self) -> FileStamp {
        let meta = std::fs::metadata(&self.manifest_path).ok()?;
        Some((meta.modified().ok()?, meta.len()))
    }

    fn read_manifest(&self) -> Result<Manifest> {
        if !self.manifest_path.exists() {
            return Ok(Manifest::default());
        }
        let content = std::fs::read_to_string(&self.manifest_path)
            .with_context(|| format!("Failed to read manifest: {}", self.manifest_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", self.manifest_path.display()))
    }

    /// Run `f` against the current manifest, reloading it if the file changed
    fn with_manifest<T>(&self, f: impl FnOnce(&Manifest) -> T) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let stamp = self.manifest_stamp();
        let stale = match cache.as_ref() {
            Some(cached) => cached.stamp != stamp || stamp.is_none(),
            None => true,
        };
        if stale {
            let manifest = self.read_manifest()?;
            *cache = Some(CachedManifest { stamp, manifest });
        }
        let cached = cache.as_ref().ok_or_else(|| anyhow!("manifest cache empty"))?;
        Ok(f(&cached.manifest))
    }

    /// Read-modify-write the manifest under the cache lock
    fn update_manifest<T>(&self, f: impl FnOnce(&mut Manifest) -> Result<T>) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = self.read_manifest()?;
        let out = f(&mut manifest)?;
        write_json_atomic(&self.manifest_path, &manifest)?;
        *cache = Some(CachedManifest {
            stamp: self.manifest_stamp(),
            manifest,
        });
        Ok(out)
    }

    fn to_asset(&self, id: AssetId, record: &AssetRecord) -> Asset {
        let source = self.root.join(&record.file);
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let variants = record.metadata.as_ref().map(|meta| {
            meta.sizes
                .iter()
                .map(|(name, v)| (name.clone(), dir.join(&v.file)))
                .collect()
        });
        Asset { id, source, variants }
    }

    /// Register image files under the library root that the manifest does
    /// not know yet, either as an original or as a variant.
    ///
    /// Hidden directories (including the engine's own data dir) are skipped.
    /// Returns the ids assigned to the new assets, ascending.
    pub fn ingest_directory(&self) -> Result<Vec<AssetId>> {
        if !self.root.exists() {
            bail!("Library root does not exist: {}", self.root.display());
        }

        self.update_manifest(|manifest| {
            let mut known: HashSet<PathBuf> = HashSet::new();
            for (id, record) in &manifest.assets {
                let asset = self.to_asset(*id, record);
                if let Some(variants) = &asset.variants {
                    known.extend(variants.values().cloned());
                }
                known.insert(asset.source);
            }

            let walker = WalkDir::new(&self.root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let hidden = entry.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false);
                    !(entry.file_type().is_dir() && hidden && entry.depth() > 0)
                });

            let mut added = Vec::new();
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry: {}", e);
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file() || !is_source_image(path) || known.contains(path) {
                    continue;
                }
                let relative = match path.strip_prefix(&self.root) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => continue,
                };

                manifest.next_id = manifest.next_id.max(manifest.assets.keys().last().copied().unwrap_or(0)) + 1;
                let id = manifest.next_id;
                manifest.assets.insert(id, AssetRecord {
                    file: relative,
                    created_at: Utc::now(),
                    metadata: None,
                });
                debug!("Registered asset {}: {}", id, path.display());
                added.push(id);
            }

            info!("Ingest found {} new image(s) under {}", added.len(), self.root.display());
            Ok(added)
        })
    }
}

impl AssetStore for ManifestLibrary {
    fn list_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>> {
        self.with_manifest(|m| {
            m.assets
                .keys()
                .skip(offset as usize)
                .take(limit)
                .copied()
                .collect()
        })
    }

    fn count(&self) -> Result<u64> {
        self.with_manifest(|m| m.assets.len() as u64)
    }

    fn asset(&self, id: AssetId) -> Result<Option<Asset>> {
        self.with_manifest(|m| m.assets.get(&id).map(|record| self.to_asset(id, record)))
    }

    fn regenerate_variants(&self, id: AssetId) -> Result<()> {
        let record = self
            .with_manifest(|m| m.assets.get(&id).cloned())?
            .ok_or_else(|| anyhow!("Unknown asset {}", id))?;
        let source = self.root.join(&record.file);
        if !source.exists() {
            bail!("Source file not found: {}", source.display());
        }

        let img = image::open(&source)
            .with_context(|| format!("Failed to decode {}", source.display()))?;
        let (width, height) = img.dimensions();
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("Source has no file stem: {}", source.display()))?
            .to_string();
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| "png".to_string());

        let mut sizes = record.metadata.map(|m| m.sizes).unwrap_or_default();
        let mut failures = Vec::new();

        for spec in self.registry.specs().iter() {
            if let Some(existing) = sizes.get(&spec.name) {
                if dir.join(&existing.file).exists() {
                    continue;
                }
            }

            let (tw, th) = target_dimensions(width, height, spec);
            let file = format!("{}-{}x{}.{}", stem, tw, th, ext);
            let path = dir.join(&file);
            let resized = resize_for(&img, spec, tw, th);

            match save_image(&resized, &path) {
                Ok(()) => {
                    debug!("Generated {} variant for asset {}: {}", spec.name, id, path.display());
                    sizes.insert(spec.name.clone(), VariantRecord { file, width: tw, height: th });
                }
                Err(e) => {
                    warn!("Failed to generate {} variant for asset {}: {:#}", spec.name, id, e);
                    failures.push(format!("{}: {:#}", spec.name, e));
                }
            }
        }

        self.update_manifest(|manifest| {
            let record = manifest
                .assets
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Asset {} disappeared during regeneration", id))?;
            record.metadata = Some(VariantMetadata { width, height, sizes });
            Ok(())
        })?;

        if !failures.is_empty() {
            bail!("Variant generation failed for asset {}: {}", id, failures.join("; "));
        }
        Ok(())
    }
}

fn is_source_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Output size of a variant. Never upscales; a bound of 0 is unbounded.
pub fn target_dimensions(width: u32, height: u32, spec: &ResolutionSpec) -> (u32, u32) {
    if spec.crop && spec.width > 0 && spec.height > 0 {
        return (spec.width.min(width).max(1), spec.height.min(height).max(1));
    }

    let bound = |b: u32| if b == 0 { f64::INFINITY } else { b as f64 };
    let scale = (bound(spec.width) / width as f64)
        .min(bound(spec.height) / height as f64)
        .min(1.0);
    let tw = ((width as f64 * scale).round() as u32).max(1);
    let th = ((height as f64 * scale).round() as u32).max(1);
    (tw, th)
}

fn resize_for(img: &DynamicImage, spec: &ResolutionSpec, tw: u32, th: u32) -> DynamicImage {
    if img.dimensions() == (tw, th) {
        img.clone()
    } else if spec.crop {
        img.resize_to_fill(tw, th, FilterType::Lanczos3)
    } else {
        img.resize_exact(tw, th, FilterType::Lanczos3)
    }
}

/// Write through a staging file so a failed encode never leaves a partial image
fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("Unsupported output format: {}", path.display()))?;
    let staging = staging_path(path);

    let written = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(img.to_rgb8()).save_with_format(&staging, format)
    } else {
        img.save_with_format(&staging, format)
    };
    if let Err(e) = written {
        let _ = std::fs::remove_file(&staging);
        return Err(e).with_context(|| format!("Failed to encode {}", path.display()));
    }

    std::fs::rename(&staging, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))
}

/// Hidden sibling used while a file is being written
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.part", name))
}
