//! Single-shot, coalescing continuation trigger.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::state::{read_json_or_default, write_json_atomic};

const SCHEDULE_FILE: &str = "schedule.json";

/// "Run the next chunk after N seconds, unless already scheduled"
pub trait ContinuationScheduler: Send + Sync {
    /// Returns false when a continuation was already pending (nothing changed)
    fn schedule(&self, delay: Duration) -> Result<bool>;

    fn cancel(&self) -> Result<()>;

    fn next_run(&self) -> Option<DateTime<Utc>>;

    /// Consume the pending continuation if it is due at `now`
    fn take_due(&self, now: DateTime<Utc>) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingRun {
    next_run: Option<DateTime<Utc>>,
}

/// Continuation persisted in the state directory, so a trigger issued by
/// one process (e.g. `imgoptd start`) is picked up by the running daemon.
pub struct FileScheduler {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileScheduler {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            path: state_dir.join(SCHEDULE_FILE),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> PendingRun {
        read_json_or_default(&self.path)
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl ContinuationScheduler for FileScheduler {
    fn schedule(&self, delay: Duration) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.read().next_run.is_some() {
            return Ok(false);
        }
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let next_run = Utc::now() + delay;
        write_json_atomic(&self.path, &PendingRun { next_run: Some(next_run) })?;
        debug!("Continuation scheduled for {}", next_run.to_rfc3339());
        Ok(true)
    }

    fn cancel(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.clear()
    }

    fn next_run(&self) -> Option<DateTime<Utc>> {
        self.read().next_run
    }

    fn take_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read().next_run {
            Some(at) if at <= now => {
                self.clear()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
