//! Persisted batch state and cumulative stats.
//!
//! Both live as JSON files in the state directory and are replaced
//! atomically (write to a sibling, then rename).

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const STATE_FILE: &str = "batch_state.json";
const STATS_FILE: &str = "stats.json";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Lifecycle of a batch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Idle => write!(f, "idle"),
            BatchStatus::Running => write!(f, "running"),
            BatchStatus::Paused => write!(f, "paused"),
        }
    }
}

/// The single global batch record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchState {
    pub status: BatchStatus,
    /// Offset into the ordered asset population
    #[serde(alias = "offset")]
    pub cursor: u64,
    /// Population size snapshotted when the pass started
    pub total: u64,
    /// Asset records visited this pass, no-op ones included
    pub processed: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Monotonic counters, reset only by an explicit reset
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateStats {
    pub mb_saved: f64,
    pub images_optimized: u64,
}

impl AggregateStats {
    /// Fold a byte count into `mb_saved`, rounded to two decimals
    pub fn add_bytes_saved(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mb = self.mb_saved + bytes as f64 / BYTES_PER_MB;
        let rounded = (mb * 100.0).round() / 100.0;
        // rounding must never move the counter backwards
        self.mb_saved = rounded.max(self.mb_saved);
    }

    pub fn add_images_optimized(&mut self, count: u64) {
        self.images_optimized = self.images_optimized.saturating_add(count);
    }
}

/// Serialize `value` to `path` via a temporary sibling and a rename
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Missing file => default; unreadable or corrupt file => warning + default
pub(crate) fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_json::from_str(&content).map_err(anyhow::Error::from));
    match parsed {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            T::default()
        }
    }
}

/// File-backed storage for [`BatchState`] and [`AggregateStats`]
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_state(&self) -> BatchState {
        read_json_or_default(&self.dir.join(STATE_FILE))
    }

    pub fn save_state(&self, state: &BatchState) -> Result<()> {
        debug!(
            "Saving batch state: {} cursor={} processed={} total={}",
            state.status, state.cursor, state.processed, state.total
        );
        write_json_atomic(&self.dir.join(STATE_FILE), state)
    }

    pub fn load_stats(&self) -> AggregateStats {
        read_json_or_default(&self.dir.join(STATS_FILE))
    }

    /// Add to the cumulative counters; zero deltas leave the file untouched
    pub fn record_savings(&self, bytes_saved: u64, images_optimized: u64) -> Result<AggregateStats> {
        let mut stats = self.load_stats();
        if bytes_saved == 0 && images_optimized == 0 {
            return Ok(stats);
        }
        stats.add_bytes_saved(bytes_saved);
        stats.add_images_optimized(images_optimized);
        write_json_atomic(&self.dir.join(STATS_FILE), &stats)?;
        info!(
            "Stats updated: {:.2} MB saved, {} image(s) optimized",
            stats.mb_saved, stats.images_optimized
        );
        Ok(stats)
    }

    /// Forget all persisted state (explicit reset / uninstall)
    pub fn reset(&self) -> Result<()> {
        for name in [STATE_FILE, STATS_FILE] {
            let path = self.dir.join(name);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}
