use std::collections::HashSet;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Directory (under the library root) holding the manifest and engine state by default
pub const DATA_DIR_NAME: &str = ".imgopt";

/// A configured output resolution, e.g. `thumbnail` at 150x150 cropped.
///
/// A bound of 0 means "unbounded" on that axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub crop: bool,
}

impl ResolutionSpec {
    pub fn new(name: &str, width: u32, height: u32, crop: bool) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            crop,
        }
    }
}

/// Configuration for the image optimization daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Root directory of the content library
    pub library_root: PathBuf,
    /// Asset manifest (defaults to `<library_root>/.imgopt/assets.json`)
    pub manifest_path: Option<PathBuf>,
    /// Where batch state, stats and the pending continuation live
    pub state_dir: Option<PathBuf>,
    /// Resolution variants every asset should have
    pub resolutions: Vec<ResolutionSpec>,
    /// User toggle for batch and on-ingest processing
    pub processing_enabled: bool,
    /// Path to the cwebp binary
    pub cwebp_bin: PathBuf,
    /// Path to the ImageMagick binary
    pub magick_bin: PathBuf,
    /// Delay before a running batch continues with its next chunk
    pub continuation_delay_secs: u64,
    /// Daemon tick interval
    pub poll_interval_secs: u64,
    /// Start a new pass automatically when idle for this long (None = manual only)
    pub rescan_interval_secs: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl OptimizerConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            library_root: PathBuf::from("/srv/media"),
            manifest_path: None,
            state_dir: None,
            resolutions: default_resolutions(),
            processing_enabled: true,
            cwebp_bin: PathBuf::from("cwebp"),
            magick_bin: PathBuf::from("magick"),
            continuation_delay_secs: 5,
            poll_interval_secs: 1,
            rescan_interval_secs: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = Self::parse_toml(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string; absent fields take their defaults
    pub fn parse_toml(content: &str) -> Result<Self> {
        let config: OptimizerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject configurations the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.resolutions {
            if spec.name.is_empty() {
                bail!("Resolution with empty name");
            }
            if spec.name == crate::registry::FULL_KEY {
                bail!("Resolution name '{}' is reserved for the original image", spec.name);
            }
            if !seen.insert(spec.name.as_str()) {
                bail!("Duplicate resolution name: {}", spec.name);
            }
            if spec.width == 0 && spec.height == 0 {
                bail!("Resolution '{}' has no bounds (0x0)", spec.name);
            }
        }
        Ok(())
    }

    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.library_root.join(DATA_DIR_NAME))
    }

    pub fn resolved_manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.library_root.join(DATA_DIR_NAME).join("assets.json"))
    }
}

fn default_resolutions() -> Vec<ResolutionSpec> {
    vec![
        ResolutionSpec::new("thumbnail", 150, 150, true),
        ResolutionSpec::new("medium", 300, 300, false),
        ResolutionSpec::new("medium_large", 768, 0, false),
        ResolutionSpec::new("large", 1024, 1024, false),
    ]
}
