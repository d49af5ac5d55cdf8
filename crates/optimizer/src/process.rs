//! Per-asset work: regenerate missing variants, then produce the derived
//! artifacts the gap report asks for.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::asset::{AssetId, AssetStore};
use crate::batch::Workload;
use crate::encode::Transcoder;
use crate::registry::{derived_path, worth_serving};
use crate::scan::{GapReport, Scanner, WorkCounts};

/// Advisory wall-clock budget for one asset
pub const ASSET_TIME_BUDGET: Duration = Duration::from_secs(120);

/// Result of processing a single asset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Missing variants were regenerated successfully
    pub regenerated: bool,
    /// Derived artifacts written
    pub derived_generated: u64,
    /// Bytes saved by artifacts smaller than their source
    pub bytes_saved: u64,
    pub errors: Vec<String>,
}

impl ProcessOutcome {
    /// Anything was produced for this asset
    pub fn did_work(&self) -> bool {
        self.regenerated || self.derived_generated > 0
    }
}

/// Scanner plus transcoder: everything needed to close an asset's gaps
pub struct Optimizer {
    scanner: Scanner,
    transcoder: Arc<Transcoder>,
}

impl Optimizer {
    pub fn new(scanner: Scanner, transcoder: Arc<Transcoder>) -> Self {
        Self { scanner, transcoder }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    fn store(&self) -> &Arc<dyn AssetStore> {
        self.scanner.store()
    }

    /// Create the derived artifact for `file` unless a good one already exists.
    ///
    /// Ok(None) means nothing needed doing; Ok(Some(saved)) reports bytes saved.
    /// An artifact that comes out too large to serve is deleted and reported.
    fn derive(&self, file: &Path) -> Result<Option<u64>, String> {
        let fs = self.scanner.fs();
        if !fs.exists(file) {
            return Ok(None);
        }
        let target = derived_path(file);
        // gaps may be stale by the time we get here
        if worth_serving(fs.as_ref(), file, &target) {
            return Ok(None);
        }
        let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if !self.transcoder.create_derived_artifact(file, &target) {
            return Err(format!("WebP creation failed for {}", name));
        }

        let (src, dst) = (fs.size(file).unwrap_or(0), fs.size(&target).unwrap_or(0));
        if !worth_serving(fs.as_ref(), file, &target) {
            if let Err(e) = std::fs::remove_file(&target) {
                warn!("Failed to remove oversized {}: {}", target.display(), e);
            }
            return Err(format!("WebP for {} is larger than its source ({} > {} bytes)", name, dst, src));
        }
        Ok(Some(src.saturating_sub(dst)))
    }

    /// Derive every file in `files`, folding results into `outcome`
    fn derive_files<'a>(&self, files: impl IntoIterator<Item = &'a PathBuf>, outcome: &mut ProcessOutcome) {
        for file in files {
            match self.derive(file) {
                Ok(Some(saved)) => {
                    outcome.derived_generated += 1;
                    outcome.bytes_saved += saved;
                }
                Ok(None) => {}
                Err(e) => outcome.errors.push(e),
            }
        }
    }

    /// Regenerate missing variants, recompute gaps, then derive what is missing.
    ///
    /// Per-file failures are collected into `errors`; nothing here aborts early
    /// except a missing source file.
    pub fn process_asset(&self, id: AssetId) -> ProcessOutcome {
        let started = Instant::now();
        let mut outcome = ProcessOutcome::default();

        let asset = match self.store().asset(id) {
            Ok(Some(asset)) => asset,
            Ok(None) => {
                outcome.errors.push(format!("Asset {}: not found", id));
                return outcome;
            }
            Err(e) => {
                outcome.errors.push(format!("Asset {}: {:#}", id, e));
                return outcome;
            }
        };
        if !self.scanner.fs().exists(&asset.source) {
            outcome.errors.push(format!("Asset {}: File not found", id));
            return outcome;
        }

        let mut gaps = self.scanner.gaps_for(&asset);

        if !gaps.missing_resolutions.is_empty() {
            debug!("Asset {} missing variants: {:?}", id, gaps.missing_resolutions);
            self.regenerate(id, &mut outcome);
            // even a partial regeneration may have written some variants
            gaps = self.scanner.get_gaps(id);
        }

        self.derive_files(gaps.missing_derived.values(), &mut outcome);

        let elapsed = started.elapsed();
        if elapsed > ASSET_TIME_BUDGET {
            warn!("Asset {} took {:.1}s (budget {}s)", id, elapsed.as_secs_f64(), ASSET_TIME_BUDGET.as_secs());
        }
        if outcome.did_work() {
            info!(
                "Asset {}: regenerated={} derived={} saved={}B in {:.1}s",
                id, outcome.regenerated, outcome.derived_generated, outcome.bytes_saved, elapsed.as_secs_f64()
            );
        }
        outcome
    }

    fn regenerate(&self, id: AssetId, outcome: &mut ProcessOutcome) {
        match self.store().regenerate_variants(id) {
            Ok(()) => outcome.regenerated = true,
            Err(e) => {
                warn!("Regeneration failed for asset {}: {:#}", id, e);
                outcome.errors.push(format!("Asset {}: could not regenerate variants: {:#}", id, e));
            }
        }
    }

    fn derive_existing(&self, id: AssetId, outcome: &mut ProcessOutcome) {
        let asset = match self.store().asset(id) {
            Ok(Some(asset)) => asset,
            Ok(None) => return,
            Err(e) => {
                outcome.errors.push(format!("Asset {}: {:#}", id, e));
                return;
            }
        };

        let mut files = vec![asset.source];
        if let Some(variants) = asset.variants {
            files.extend(variants.into_values());
        }
        self.derive_files(&files, outcome);
    }

    /// Derived artifacts only, for the original and every existing variant.
    /// Never regenerates variants. Returns files written.
    pub fn generate_derived_for_asset(&self, id: AssetId) -> usize {
        let mut outcome = ProcessOutcome::default();
        self.derive_existing(id, &mut outcome);
        for e in &outcome.errors {
            warn!("Asset {}: {}", id, e);
        }
        outcome.derived_generated as usize
    }

    /// Newly registered asset: generate its variants through the store, then
    /// derive artifacts for whatever exists afterwards.
    pub fn ingest_asset(&self, id: AssetId) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        self.regenerate(id, &mut outcome);
        self.derive_existing(id, &mut outcome);
        if outcome.did_work() {
            info!("Ingested asset {}: derived={} saved={}B", id, outcome.derived_generated, outcome.bytes_saved);
        }
        outcome
    }

    /// Delete every `<stem>.webp` next to known originals and variants.
    ///
    /// Derived artifacts are identified by path alone, so a WebP a user put
    /// beside a registered image under the same stem is removed as well.
    /// Files not adjacent to a registered image are never touched.
    /// Returns the number of files removed.
    pub fn purge_derived(&self) -> Result<usize> {
        let total = self.scanner.count_assets()?;
        let ids = self.scanner.list_asset_ids(total as usize, 0)?;

        let mut removed = 0;
        for id in ids {
            let Some(asset) = self.store().asset(id)? else {
                continue;
            };
            let mut files = vec![asset.source];
            if let Some(variants) = asset.variants {
                files.extend(variants.into_values());
            }
            for file in files {
                let derived = derived_path(&file);
                if derived.is_file() {
                    std::fs::remove_file(&derived)
                        .with_context(|| format!("Failed to remove {}", derived.display()))?;
                    removed += 1;
                }
            }
        }
        info!("Removed {} derived artifact(s)", removed);
        Ok(removed)
    }
}

impl Workload for Optimizer {
    fn count_assets(&self) -> Result<u64> {
        self.scanner.count_assets()
    }

    fn list_asset_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>> {
        self.scanner.list_asset_ids(limit, offset)
    }

    fn get_gaps(&self, id: AssetId) -> GapReport {
        self.scanner.get_gaps(id)
    }

    fn process_asset(&self, id: AssetId) -> ProcessOutcome {
        Optimizer::process_asset(self, id)
    }

    fn counts_needing_work(&self) -> Result<WorkCounts> {
        self.scanner.get_counts_needing_work()
    }

    fn purge_derived(&self) -> Result<usize> {
        Optimizer::purge_derived(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionSpec;
    use crate::encode::{EncodeError, Encoder, ImageCrateEncoder};
    use crate::library::ManifestLibrary;
    use crate::registry::{LocalFs, ResolutionRegistry};
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    const FAKE_WEBP: &[u8] = b"RIFF\x04\0\0\0WEBP";

    /// Writes a tiny fixed payload, so every artifact is smaller than its source
    struct TinyEncoder;

    impl Encoder for TinyEncoder {
        fn name(&self) -> &str {
            "tiny"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn encode(&self, _source: &Path, output: &Path) -> Result<(), EncodeError> {
            std::fs::write(output, FAKE_WEBP)?;
            Ok(())
        }
    }

    /// Writes twice the source size, so nothing it produces is worth serving
    struct BloatEncoder;

    impl Encoder for BloatEncoder {
        fn name(&self) -> &str {
            "bloat"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn encode(&self, source: &Path, output: &Path) -> Result<(), EncodeError> {
            let len = std::fs::metadata(source)?.len() as usize;
            std::fs::write(output, vec![0u8; len * 2])?;
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        library: Arc<ManifestLibrary>,
        optimizer: Optimizer,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(TinyEncoder))
    }

    fn fixture_with(encoder: Arc<dyn Encoder>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let registry = Arc::new(ResolutionRegistry::new(vec![
            ResolutionSpec::new("thumb", 64, 64, true),
            ResolutionSpec::new("medium", 128, 128, false),
        ]));
        let library = Arc::new(ManifestLibrary::new(root.clone(), root.join(".imgopt/assets.json"), registry.clone()));
        let scanner = Scanner::new(library.clone(), registry, Arc::new(LocalFs));
        let optimizer = Optimizer::new(scanner, Arc::new(Transcoder::new(vec![encoder])));
        Fixture { dir, library, optimizer }
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 77])).save(path).unwrap();
    }

    /// Smooth photographic-style content, saved as a high quality JPEG
    fn write_jpeg(path: &Path, w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, ((x + y) * 127 / (w + h)) as u8 + 64])
        });
        let file = std::fs::File::create(path).unwrap();
        JpegEncoder::new_with_quality(file, 95).encode_image(&img).unwrap();
    }

    fn size(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().len()
    }

    #[test]
    fn test_process_asset_closes_every_gap() {
        let f = fixture();
        let src = f.dir.path().join("sunset.png");
        write_png(&src, 300, 200);
        f.library.ingest_directory().unwrap();

        let outcome = f.optimizer.process_asset(1);
        assert!(outcome.regenerated);
        assert_eq!(outcome.derived_generated, 3);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

        let asset = f.library.asset(1).unwrap().unwrap();
        let mut expected_saved = size(&src) - FAKE_WEBP.len() as u64;
        for path in asset.variants.as_ref().unwrap().values() {
            assert!(derived_path(path).exists());
            expected_saved += size(path) - FAKE_WEBP.len() as u64;
        }
        assert_eq!(outcome.bytes_saved, expected_saved);
        assert!(f.optimizer.scanner().get_gaps(1).is_empty());
    }

    #[test]
    fn test_process_asset_is_idempotent() {
        let f = fixture();
        write_png(&f.dir.path().join("a.png"), 90, 90);
        f.library.ingest_directory().unwrap();

        let first = f.optimizer.process_asset(1);
        assert!(first.did_work());
        let second = f.optimizer.process_asset(1);
        assert!(!second.regenerated);
        assert_eq!(second.derived_generated, 0);
        assert_eq!(second.bytes_saved, 0);
        assert!(second.errors.is_empty());
    }

    #[test]
    fn test_jpeg_with_in_process_encoder_settles_after_one_pass() {
        let f = fixture_with(Arc::new(ImageCrateEncoder));
        let src = f.dir.path().join("photo.jpg");
        write_jpeg(&src, 256, 256);
        f.library.ingest_directory().unwrap();

        let first = f.optimizer.process_asset(1);
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        assert!(first.regenerated);
        assert_eq!(first.derived_generated, 3);
        assert!(first.bytes_saved > 0);
        assert!(size(&derived_path(&src)) < size(&src));
        assert!(f.optimizer.scanner().get_gaps(1).is_empty());

        let second = f.optimizer.process_asset(1);
        assert!(!second.did_work());
        assert_eq!(second.bytes_saved, 0);
        assert!(second.errors.is_empty(), "{:?}", second.errors);
    }

    #[test]
    fn test_oversized_artifact_is_removed_and_reported() {
        let f = fixture_with(Arc::new(BloatEncoder));
        let src = f.dir.path().join("flat.png");
        write_png(&src, 100, 100);
        f.library.ingest_directory().unwrap();

        let first = f.optimizer.process_asset(1);
        assert!(first.regenerated);
        assert_eq!(first.derived_generated, 0);
        assert_eq!(first.bytes_saved, 0);
        assert_eq!(first.errors.len(), 3);
        assert!(first.errors.iter().all(|e| e.contains("larger than its source")));
        assert!(!derived_path(&src).exists());

        // nothing is counted as work on a retry either
        let second = f.optimizer.process_asset(1);
        assert!(!second.did_work());
        assert_eq!(second.errors.len(), 3);
    }

    #[test]
    fn test_regeneration_failure_still_derives_full_image() {
        let f = fixture();
        std::fs::write(f.dir.path().join("broken.jpg"), vec![7u8; 4096]).unwrap();
        f.library.ingest_directory().unwrap();

        let outcome = f.optimizer.process_asset(1);
        assert!(!outcome.regenerated);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("regenerate"));
        assert_eq!(outcome.derived_generated, 1);
        assert!(f.dir.path().join("broken.webp").exists());
    }

    #[test]
    fn test_missing_source_reports_error() {
        let f = fixture();
        let src = f.dir.path().join("gone.png");
        write_png(&src, 20, 20);
        f.library.ingest_directory().unwrap();
        std::fs::remove_file(&src).unwrap();

        let outcome = f.optimizer.process_asset(1);
        assert_eq!(outcome.errors, vec!["Asset 1: File not found".to_string()]);
        assert!(!outcome.did_work());

        let unknown = f.optimizer.process_asset(9);
        assert_eq!(unknown.errors.len(), 1);
    }

    #[test]
    fn test_failed_transcode_is_collected_per_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let registry = Arc::new(ResolutionRegistry::new(vec![ResolutionSpec::new("thumb", 32, 32, true)]));
        let library = Arc::new(ManifestLibrary::new(root.clone(), root.join("m.json"), registry.clone()));
        let optimizer = Optimizer::new(
            Scanner::new(library.clone(), registry, Arc::new(LocalFs)),
            Arc::new(Transcoder::new(Vec::new())),
        );
        write_png(&root.join("pic.png"), 50, 50);
        library.ingest_directory().unwrap();

        let outcome = optimizer.process_asset(1);
        assert!(outcome.regenerated);
        assert_eq!(outcome.derived_generated, 0);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().any(|e| e.contains("pic.png")));
    }

    #[test]
    fn test_generate_derived_for_asset_skips_regeneration() {
        let f = fixture();
        write_png(&f.dir.path().join("b.png"), 100, 80);
        f.library.ingest_directory().unwrap();

        assert_eq!(f.optimizer.generate_derived_for_asset(1), 1);
        assert!(f.library.asset(1).unwrap().unwrap().variants.is_none());
        assert_eq!(f.optimizer.generate_derived_for_asset(1), 0);
        assert_eq!(f.optimizer.generate_derived_for_asset(99), 0);

        f.library.regenerate_variants(1).unwrap();
        assert_eq!(f.optimizer.generate_derived_for_asset(1), 2);
        let webps: Vec<PathBuf> = std::fs::read_dir(f.dir.path())
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|x| x == "webp").unwrap_or(false))
            .collect();
        assert_eq!(webps.len(), 3);
    }

    #[test]
    fn test_ingest_asset_regenerates_then_derives() {
        let f = fixture();
        let src = f.dir.path().join("new.png");
        write_png(&src, 200, 150);
        let ids = f.library.ingest_directory().unwrap();
        assert_eq!(ids, vec![1]);

        let outcome = f.optimizer.ingest_asset(1);
        assert!(outcome.regenerated);
        assert_eq!(outcome.derived_generated, 3);
        assert!(outcome.bytes_saved > 0);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert!(f.optimizer.scanner().get_gaps(1).is_empty());

        let unknown = f.optimizer.ingest_asset(42);
        assert!(!unknown.did_work());
        assert_eq!(unknown.errors.len(), 1);
    }

    #[test]
    fn test_purge_derived_removes_only_artifacts() {
        let f = fixture();
        write_png(&f.dir.path().join("dog.png"), 120, 120);
        f.library.ingest_directory().unwrap();
        f.optimizer.process_asset(1);
        // not next to any registered image
        let stray = f.dir.path().join("logo.webp");
        std::fs::write(&stray, FAKE_WEBP).unwrap();

        let asset = f.library.asset(1).unwrap().unwrap();
        assert_eq!(f.optimizer.purge_derived().unwrap(), 3);
        assert!(asset.source.exists());
        assert!(!derived_path(&asset.source).exists());
        assert!(asset.variants.unwrap().values().all(|p| p.exists() && !derived_path(p).exists()));
        assert_eq!(f.optimizer.purge_derived().unwrap(), 0);
        assert!(stray.exists());
    }
}
