//! WebP transcoding backends.
//!
//! Backends are tried in priority order; the first one that produces an
//! output wins. Every backend writes to a hidden staging file which is only
//! renamed onto the target after a successful encode, so a failed attempt
//! never leaves a partial artifact behind.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::OptimizerConfig;
use crate::library::staging_path;

/// Lossy quality used by every backend
pub const WEBP_QUALITY: u8 = 82;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{0} is not available")]
    Unavailable(String),

    #[error("{tool} exited with status {code:?}: {stderr}")]
    ExitStatus {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("libwebp error: {0}")]
    Libwebp(String),

    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// One way of turning a raster image into a WebP file
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Encode `source` into `output`. `output` may not carry a `.webp` extension.
    fn encode(&self, source: &Path, output: &Path) -> Result<(), EncodeError>;
}

/// Probe a binary by running it with a version flag
fn probe(bin: &Path, arg: &str) -> bool {
    let ok = Command::new(bin)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    debug!("Probed {}: {}", bin.display(), if ok { "available" } else { "unavailable" });
    ok
}

fn run_tool(tool: &str, mut cmd: Command) -> Result<(), EncodeError> {
    debug!("Executing {}: {:?}", tool, cmd);
    let output = cmd.stdin(Stdio::null()).output()?;
    if !output.status.success() {
        return Err(EncodeError::ExitStatus {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Google's `cwebp` command-line encoder
pub struct CwebpCli {
    bin: PathBuf,
    available: OnceLock<bool>,
}

impl CwebpCli {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin, available: OnceLock::new() }
    }
}

impl Encoder for CwebpCli {
    fn name(&self) -> &str {
        "cwebp"
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| probe(&self.bin, "-version"))
    }

    fn encode(&self, source: &Path, output: &Path) -> Result<(), EncodeError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-q")
            .arg(WEBP_QUALITY.to_string())
            .args(["-quiet", "-metadata", "none"])
            .arg(source)
            .arg("-o")
            .arg(output);
        run_tool(self.name(), cmd)
    }
}

/// ImageMagick, via its `magick` entry point
pub struct MagickCli {
    bin: PathBuf,
    available: OnceLock<bool>,
}

impl MagickCli {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin, available: OnceLock::new() }
    }
}

impl Encoder for MagickCli {
    fn name(&self) -> &str {
        "imagemagick"
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| probe(&self.bin, "-version"))
    }

    fn encode(&self, source: &Path, output: &Path) -> Result<(), EncodeError> {
        // explicit format prefix: the staging name does not end in .webp
        let mut target = std::ffi::OsString::from("webp:");
        target.push(output.as_os_str());

        let mut cmd = Command::new(&self.bin);
        cmd.arg(source)
            .arg("-strip")
            .arg("-quality")
            .arg(WEBP_QUALITY.to_string())
            .arg(target);
        run_tool(self.name(), cmd)
    }
}

/// In-process fallback: decodes with `image` and encodes lossy through libwebp
#[derive(Debug, Default)]
pub struct ImageCrateEncoder;

impl Encoder for ImageCrateEncoder {
    fn name(&self) -> &str {
        "libwebp"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn encode(&self, source: &Path, output: &Path) -> Result<(), EncodeError> {
        let img = image::open(source)?;
        let (width, height) = (img.width(), img.height());
        let quality = WEBP_QUALITY as f32;

        // libwebp only takes 8-bit RGB or RGBA
        let (pixels, layout) = if img.color().has_alpha() {
            (img.to_rgba8().into_raw(), webp::PixelLayout::Rgba)
        } else {
            (img.to_rgb8().into_raw(), webp::PixelLayout::Rgb)
        };
        let encoder = webp::Encoder::new(&pixels, layout, width, height);
        let encoded = encoder
            .encode_simple(false, quality)
            .map_err(|e| EncodeError::Libwebp(format!("{:?}", e)))?;

        std::fs::write(output, &*encoded)?;
        Ok(())
    }
}

/// Ordered chain of encoder backends
pub struct Transcoder {
    backends: Vec<Arc<dyn Encoder>>,
}

impl Transcoder {
    pub fn new(backends: Vec<Arc<dyn Encoder>>) -> Self {
        Self { backends }
    }

    /// cwebp, then ImageMagick, then the in-process encoder
    pub fn from_config(cfg: &OptimizerConfig) -> Self {
        let backends: Vec<Arc<dyn Encoder>> = vec![
            Arc::new(CwebpCli::new(cfg.cwebp_bin.clone())),
            Arc::new(MagickCli::new(cfg.magick_bin.clone())),
            Arc::new(ImageCrateEncoder),
        ];
        Self::new(backends)
    }

    pub fn available_backends(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|b| b.is_available())
            .map(|b| b.name())
            .collect()
    }

    pub fn has_available_backend(&self) -> bool {
        self.backends.iter().any(|b| b.is_available())
    }

    /// Write the WebP artifact for `source` at `target`.
    ///
    /// Returns true only if `target` exists afterwards as a complete file.
    /// Failures are logged, never raised.
    pub fn create_derived_artifact(&self, source: &Path, target: &Path) -> bool {
        if !source.is_file() {
            warn!("Cannot transcode missing source: {}", source.display());
            return false;
        }

        let staging = staging_path(target);
        let mut attempted = false;

        for backend in &self.backends {
            if !backend.is_available() {
                continue;
            }
            attempted = true;

            match self.try_backend(backend.as_ref(), source, &staging, target) {
                Ok(()) => {
                    info!("Created {} with {}", target.display(), backend.name());
                    return true;
                }
                Err(e) => {
                    warn!("{} failed on {}: {}", backend.name(), source.display(), e);
                    let _ = std::fs::remove_file(&staging);
                }
            }
        }

        if !attempted {
            warn!("No WebP encoder available for {}", source.display());
        }
        false
    }

    fn try_backend(
        &self,
        backend: &dyn Encoder,
        source: &Path,
        staging: &Path,
        target: &Path,
    ) -> Result<(), EncodeError> {
        backend.encode(source, staging)?;
        let written = std::fs::metadata(staging).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(EncodeError::MissingOutput(staging.to_path_buf()));
        }
        std::fs::rename(staging, target)?;
        Ok(())
    }
}
