use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::batch::{self, ChunkResult, Continuation, StartOutcome, Workload};
use crate::gate::CapabilityGate;
use crate::schedule::ContinuationScheduler;
use crate::state::{AggregateStats, BatchState, BatchStatus, StateStore};

/// Read-only snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: BatchState,
    pub stats: AggregateStats,
    pub total_assets: Option<u64>,
    /// Only filled when counts were requested (full population walk)
    pub needing_work: Option<u64>,
    pub optimized_assets: Option<u64>,
    pub next_run: Option<DateTime<Utc>>,
    pub ready: bool,
    pub processing_enabled: bool,
}

/// Hosts the batch state machine: loads state, runs a transition, stores
/// the result and acts on its continuation directive.
///
/// Operations are serialised within one process. Separate processes
/// sharing a state directory are not locked against each other.
pub struct BatchEngine {
    store: StateStore,
    scheduler: Arc<dyn ContinuationScheduler>,
    gate: Arc<dyn CapabilityGate>,
    workload: Arc<dyn Workload>,
    continuation_delay: Duration,
    single_flight: Mutex<()>,
}

impl BatchEngine {
    pub fn new(
        store: StateStore,
        scheduler: Arc<dyn ContinuationScheduler>,
        gate: Arc<dyn CapabilityGate>,
        workload: Arc<dyn Workload>,
        continuation_delay: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            gate,
            workload,
            continuation_delay,
            single_flight: Mutex::new(()),
        }
    }

    pub fn gate(&self) -> &Arc<dyn CapabilityGate> {
        &self.gate
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.single_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, continuation: Continuation) -> Result<()> {
        match continuation {
            Continuation::Schedule => {
                if !self.scheduler.schedule(self.continuation_delay)? {
                    // coalesced with an already pending run
                    debug!("Continuation already pending");
                }
            }
            Continuation::Cancel => self.scheduler.cancel()?,
            Continuation::Keep => {}
        }
        Ok(())
    }

    pub fn start(&self) -> Result<StartOutcome> {
        let _guard = self.lock();
        let t = batch::start(&self.store.load_state(), self.gate.as_ref(), self.workload.as_ref());
        if t.changed {
            self.store.save_state(&t.state)?;
        }
        self.apply(t.continuation)?;
        Ok(t.result)
    }

    pub fn pause(&self) -> Result<()> {
        let _guard = self.lock();
        let t = batch::pause(&self.store.load_state());
        if t.changed {
            self.store.save_state(&t.state)?;
        }
        self.apply(t.continuation)
    }

    /// Run one chunk now. Per-asset failures land in the result; only
    /// persistence failures are returned as errors.
    pub fn run_chunk(&self) -> Result<ChunkResult> {
        let _guard = self.lock();
        let t = batch::run_chunk(
            &self.store.load_state(),
            self.gate.as_ref(),
            self.workload.as_ref(),
            Utc::now(),
        );
        if t.changed {
            self.store.save_state(&t.state)?;
        }
        self.store.record_savings(t.result.bytes_saved, t.result.assets_optimized)?;
        self.apply(t.continuation)?;
        Ok(t.result.result)
    }

    /// Re-arm the continuation of a pass left running (e.g. after a restart).
    /// Returns true if one was scheduled.
    pub fn ensure_continuation(&self) -> Result<bool> {
        let _guard = self.lock();
        let state = self.store.load_state();
        if state.status != BatchStatus::Running || self.scheduler.next_run().is_some() {
            return Ok(false);
        }
        info!("Resuming running batch at {}/{}", state.cursor, state.total);
        self.scheduler.schedule(Duration::ZERO)
    }

    pub fn status(&self, include_counts: bool) -> StatusReport {
        let state = self.store.load_state();
        let stats = self.store.load_stats();

        let mut report = StatusReport {
            state,
            stats,
            total_assets: None,
            needing_work: None,
            optimized_assets: None,
            next_run: self.scheduler.next_run(),
            ready: self.gate.is_ready(),
            processing_enabled: self.gate.is_processing_enabled(),
        };

        if include_counts {
            match self.workload.counts_needing_work() {
                Ok(counts) => {
                    report.total_assets = Some(counts.total);
                    report.needing_work = Some(counts.needing_work);
                    report.optimized_assets = Some(counts.total.saturating_sub(counts.needing_work));
                }
                Err(e) => warn!("Could not compute work counts: {:#}", e),
            }
        } else {
            report.total_assets = self.workload.count_assets().ok();
        }
        report
    }

    /// Forget batch state, stats and any pending continuation; optionally
    /// delete every derived artifact too. Returns the number of files purged.
    pub fn reset(&self, purge_derived: bool) -> Result<usize> {
        let _guard = self.lock();
        self.scheduler.cancel()?;
        self.store.reset()?;
        let purged = if purge_derived { self.workload.purge_derived()? } else { 0 };
        info!("Optimizer state reset");
        Ok(purged)
    }
}
