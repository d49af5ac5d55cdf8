//! Preconditions that must hold before any batch work happens.

use std::path::PathBuf;
use std::sync::Arc;
use log::{debug, warn};

use crate::encode::Transcoder;

/// Host capability check consulted before every state transition
pub trait CapabilityGate: Send + Sync {
    /// Environment can run the optimizer at all
    fn is_ready(&self) -> bool;

    /// User toggle for processing
    fn is_processing_enabled(&self) -> bool;

    fn is_open(&self) -> bool {
        self.is_ready() && self.is_processing_enabled()
    }
}

/// Gate backed by the real environment: library root present, state dir
/// writable, at least one WebP encoder usable.
pub struct EnvironmentGate {
    library_root: PathBuf,
    state_dir: PathBuf,
    transcoder: Arc<Transcoder>,
    processing_enabled: bool,
}

impl EnvironmentGate {
    pub fn new(
        library_root: PathBuf,
        state_dir: PathBuf,
        transcoder: Arc<Transcoder>,
        processing_enabled: bool,
    ) -> Self {
        Self { library_root, state_dir, transcoder, processing_enabled }
    }

    fn state_dir_writable(&self) -> bool {
        if std::fs::create_dir_all(&self.state_dir).is_err() {
            return false;
        }
        std::fs::metadata(&self.state_dir)
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false)
    }
}

impl CapabilityGate for EnvironmentGate {
    fn is_ready(&self) -> bool {
        if !self.library_root.is_dir() {
            warn!("Library root unavailable: {}", self.library_root.display());
            return false;
        }
        if !self.state_dir_writable() {
            warn!("State directory not writable: {}", self.state_dir.display());
            return false;
        }
        if !self.transcoder.has_available_backend() {
            warn!("No WebP encoder available");
            return false;
        }
        debug!("Environment ready");
        true
    }

    fn is_processing_enabled(&self) -> bool {
        self.processing_enabled
    }
}

/// Fixed answers, for hosts that decide readiness elsewhere
#[derive(Debug, Clone, Copy)]
pub struct StaticGate {
    pub ready: bool,
    pub enabled: bool,
}

impl StaticGate {
    pub fn open() -> Self {
        Self { ready: true, enabled: true }
    }
}

impl CapabilityGate for StaticGate {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn is_processing_enabled(&self) -> bool {
        self.enabled
    }
}
