//! Batch pass state machine.
//!
//! `idle -> running -> (paused | idle)`, `paused -> running`.
//!
//! The transitions are plain functions from the current [`BatchState`] to
//! the next one plus a [`Continuation`] directive; loading and storing the
//! state and acting on the directive is left to the host
//! (see [`crate::engine::BatchEngine`]).

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::asset::AssetId;
use crate::gate::CapabilityGate;
use crate::process::ProcessOutcome;
use crate::scan::{GapReport, WorkCounts};
use crate::state::{BatchState, BatchStatus};

/// Assets visited per chunk
pub const BATCH_SIZE: usize = 15;

/// Errors surfaced per chunk; the rest are dropped (and retried next pass)
pub const MAX_CHUNK_ERRORS: usize = 5;

/// What a batch pass works through
pub trait Workload: Send + Sync {
    fn count_assets(&self) -> Result<u64>;

    fn list_asset_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>>;

    fn get_gaps(&self, id: AssetId) -> GapReport;

    fn process_asset(&self, id: AssetId) -> ProcessOutcome;

    /// Full population walk, for status display only
    fn counts_needing_work(&self) -> Result<WorkCounts>;

    fn purge_derived(&self) -> Result<usize>;
}

/// What the host should do with the pending continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Arrange for the next chunk (coalescing)
    Schedule,
    Cancel,
    /// Leave whatever is pending alone
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkResult {
    /// Derived artifacts written plus regenerations this chunk
    pub processed: u64,
    pub done: bool,
    pub errors: Vec<String>,
}

impl ChunkResult {
    fn noop() -> Self {
        Self { processed: 0, done: true, errors: Vec::new() }
    }
}

/// Next state after a transition, plus the host's to-do list
#[derive(Debug, Clone)]
pub struct Transition<T> {
    pub state: BatchState,
    /// False when `state` is identical to the input and need not be stored
    pub changed: bool,
    pub continuation: Continuation,
    pub result: T,
}

impl<T> Transition<T> {
    fn unchanged(state: &BatchState, result: T) -> Self {
        Self { state: state.clone(), changed: false, continuation: Continuation::Keep, result }
    }
}

/// Chunk result plus the deltas for the cumulative stats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub result: ChunkResult,
    pub bytes_saved: u64,
    /// Assets that got at least one regeneration or derived artifact
    pub assets_optimized: u64,
}

fn not_ready_message(gate: &dyn CapabilityGate) -> &'static str {
    if !gate.is_ready() {
        "Image optimization is not available on this system"
    } else {
        "Image optimization is disabled"
    }
}

pub fn start(
    state: &BatchState,
    gate: &dyn CapabilityGate,
    workload: &dyn Workload,
) -> Transition<StartOutcome> {
    if !gate.is_open() {
        let message = not_ready_message(gate).to_string();
        warn!("Refusing to start batch: {}", message);
        return Transition::unchanged(state, StartOutcome { success: false, message });
    }

    let mut next = state.clone();
    let message = match state.status {
        BatchStatus::Running => {
            return Transition::unchanged(
                state,
                StartOutcome { success: true, message: "Batch already running".to_string() },
            );
        }
        BatchStatus::Idle => {
            let total = match workload.count_assets() {
                Ok(total) => total,
                Err(e) => {
                    let message = format!("Could not count assets: {:#}", e);
                    warn!("{}", message);
                    return Transition::unchanged(state, StartOutcome { success: false, message });
                }
            };
            next.total = total;
            next.cursor = 0;
            next.processed = 0;
            format!("Batch started over {} asset(s)", total)
        }
        BatchStatus::Paused => format!("Batch resumed at {}/{}", state.cursor, state.total),
    };
    next.status = BatchStatus::Running;
    info!("{}", message);

    Transition {
        state: next,
        changed: true,
        continuation: Continuation::Schedule,
        result: StartOutcome { success: true, message },
    }
}

/// Only prevents the next chunk; a chunk in flight runs to completion
pub fn pause(state: &BatchState) -> Transition<()> {
    let mut transition = Transition::unchanged(state, ());
    transition.continuation = Continuation::Cancel;
    if state.status == BatchStatus::Running {
        transition.state.status = BatchStatus::Paused;
        transition.changed = true;
        info!("Batch paused at {}/{}", state.cursor, state.total);
    }
    transition
}

fn finalize(state: &mut BatchState) {
    state.status = BatchStatus::Idle;
    state.cursor = 0;
    info!("Batch pass complete: {} asset(s) visited", state.processed);
}

pub fn run_chunk(
    state: &BatchState,
    gate: &dyn CapabilityGate,
    workload: &dyn Workload,
    now: DateTime<Utc>,
) -> Transition<ChunkReport> {
    let noop = ChunkReport { result: ChunkResult::noop(), bytes_saved: 0, assets_optimized: 0 };
    if !gate.is_open() {
        debug!("Skipping chunk: {}", not_ready_message(gate));
        return Transition::unchanged(state, noop);
    }
    if state.status != BatchStatus::Running {
        debug!("Skipping chunk: batch is {}", state.status);
        return Transition::unchanged(state, noop);
    }

    let ids = match workload.list_asset_ids(BATCH_SIZE, state.cursor) {
        Ok(ids) => ids,
        Err(e) => {
            // keep the pass alive; the next continuation retries the same page
            let message = format!("Could not list assets at {}: {:#}", state.cursor, e);
            warn!("{}", message);
            let mut transition = Transition::unchanged(
                state,
                ChunkReport {
                    result: ChunkResult { processed: 0, done: false, errors: vec![message] },
                    bytes_saved: 0,
                    assets_optimized: 0,
                },
            );
            transition.continuation = Continuation::Schedule;
            return transition;
        }
    };

    let mut next = state.clone();
    if ids.is_empty() {
        finalize(&mut next);
        return Transition { state: next, changed: true, continuation: Continuation::Cancel, result: noop };
    }

    info!("Processing chunk of {} asset(s) from {}/{}", ids.len(), state.cursor, state.total);
    let mut report = ChunkReport {
        result: ChunkResult { processed: 0, done: false, errors: Vec::new() },
        bytes_saved: 0,
        assets_optimized: 0,
    };

    for id in &ids {
        if !workload.get_gaps(*id).is_empty() {
            let outcome = workload.process_asset(*id);
            report.result.processed += outcome.derived_generated + u64::from(outcome.regenerated);
            report.bytes_saved += outcome.bytes_saved;
            if outcome.did_work() {
                report.assets_optimized += 1;
            }
            let room = MAX_CHUNK_ERRORS.saturating_sub(report.result.errors.len());
            report.result.errors.extend(outcome.errors.into_iter().take(room));
        }
        next.cursor += 1;
        next.processed += 1;
    }

    next.last_run = Some(now);
    let continuation = if next.cursor >= next.total || ids.len() < BATCH_SIZE {
        finalize(&mut next);
        report.result.done = true;
        Continuation::Cancel
    } else {
        Continuation::Schedule
    };

    info!(
        "Chunk finished: {} item(s) produced, {} error(s), cursor {}/{}",
        report.result.processed,
        report.result.errors.len(),
        next.cursor,
        next.total
    );
    Transition { state: next, changed: true, continuation, result: report }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gate::StaticGate;
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Ids 1..=population. Assets in `needing_work` report a gap until processed.
    #[derive(Default)]
    pub(crate) struct FakeWorkload {
        pub(crate) population: u64,
        pub(crate) needing_work: Mutex<BTreeSet<AssetId>>,
        pub(crate) visited: Mutex<Vec<AssetId>>,
        pub(crate) processed: Mutex<Vec<AssetId>>,
        pub(crate) errors_per_asset: usize,
        pub(crate) fail_listing: bool,
    }

    impl FakeWorkload {
        pub(crate) fn new(population: u64) -> Self {
            Self { population, ..Default::default() }
        }

        pub(crate) fn with_work(self, ids: impl IntoIterator<Item = AssetId>) -> Self {
            self.needing_work.lock().unwrap().extend(ids);
            self
        }
    }

    impl Workload for FakeWorkload {
        fn count_assets(&self) -> Result<u64> {
            Ok(self.population)
        }

        fn list_asset_ids(&self, limit: usize, offset: u64) -> Result<Vec<AssetId>> {
            if self.fail_listing {
                return Err(anyhow!("metadata store offline"));
            }
            Ok((offset + 1..=self.population).take(limit).collect())
        }

        fn get_gaps(&self, id: AssetId) -> GapReport {
            self.visited.lock().unwrap().push(id);
            let mut gaps = GapReport::default();
            if self.needing_work.lock().unwrap().contains(&id) {
                gaps.missing_derived.insert("full".into(), PathBuf::from(format!("/a/{}.jpg", id)));
            }
            gaps
        }

        fn process_asset(&self, id: AssetId) -> ProcessOutcome {
            self.processed.lock().unwrap().push(id);
            let failed = self.errors_per_asset > 0;
            if !failed {
                self.needing_work.lock().unwrap().remove(&id);
            }
            ProcessOutcome {
                regenerated: !failed,
                derived_generated: if failed { 0 } else { 2 },
                bytes_saved: if failed { 0 } else { 1000 },
                errors: (0..self.errors_per_asset).map(|i| format!("asset {} error {}", id, i)).collect(),
            }
        }

        fn counts_needing_work(&self) -> Result<WorkCounts> {
            Ok(WorkCounts {
                total: self.population,
                needing_work: self.needing_work.lock().unwrap().len() as u64,
            })
        }

        fn purge_derived(&self) -> Result<usize> {
            Ok(0)
        }
    }

    fn started(workload: &FakeWorkload) -> BatchState {
        let t = start(&BatchState::default(), &StaticGate::open(), workload);
        assert!(t.result.success);
        t.state
    }

    #[test]
    fn test_start_from_idle_snapshots_total() {
        let workload = FakeWorkload::new(37);
        let stale = BatchState { cursor: 9, processed: 9, total: 3, ..Default::default() };
        let t = start(&stale, &StaticGate::open(), &workload);

        assert!(t.result.success);
        assert!(t.changed);
        assert_eq!(t.continuation, Continuation::Schedule);
        assert_eq!(t.state.status, BatchStatus::Running);
        assert_eq!((t.state.cursor, t.state.processed, t.state.total), (0, 0, 37));
    }

    #[test]
    fn test_start_when_running_is_noop_success() {
        let workload = FakeWorkload::new(5);
        let running = BatchState { status: BatchStatus::Running, cursor: 3, total: 5, processed: 3, last_run: None };
        let t = start(&running, &StaticGate::open(), &workload);
        assert!(t.result.success);
        assert!(!t.changed);
        assert_eq!(t.continuation, Continuation::Keep);
        assert_eq!(t.state, running);
    }

    #[test]
    fn test_start_refused_when_gate_closed() {
        let workload = FakeWorkload::new(5);
        let t = start(&BatchState::default(), &StaticGate { ready: true, enabled: false }, &workload);
        assert!(!t.result.success);
        assert_eq!(t.result.message, "Image optimization is disabled");
        assert!(!t.changed);
        assert_eq!(t.state.status, BatchStatus::Idle);

        let t = start(&BatchState::default(), &StaticGate { ready: false, enabled: true }, &workload);
        assert!(!t.result.success);
        assert_eq!(t.continuation, Continuation::Keep);
    }

    #[test]
    fn test_pause_only_from_running() {
        let running = BatchState { status: BatchStatus::Running, cursor: 15, total: 37, processed: 15, last_run: None };
        let t = pause(&running);
        assert!(t.changed);
        assert_eq!(t.state.status, BatchStatus::Paused);
        assert_eq!(t.continuation, Continuation::Cancel);

        let t = pause(&BatchState::default());
        assert!(!t.changed);
        assert_eq!(t.state.status, BatchStatus::Idle);
        assert_eq!(t.continuation, Continuation::Cancel);
    }

    #[test]
    fn test_37_assets_take_three_chunks() {
        let workload = FakeWorkload::new(37).with_work([2, 20, 36]);
        let gate = StaticGate::open();
        let mut state = started(&workload);

        let mut chunks = 0;
        let mut produced = 0;
        let mut saved = 0;
        loop {
            let t = run_chunk(&state, &gate, &workload, Utc::now());
            chunks += 1;
            produced += t.result.result.processed;
            saved += t.result.bytes_saved;
            state = t.state;
            if t.result.result.done {
                assert_eq!(t.continuation, Continuation::Cancel);
                break;
            }
            assert_eq!(t.continuation, Continuation::Schedule);
        }

        assert_eq!(chunks, 3);
        assert_eq!(state.status, BatchStatus::Idle);
        assert_eq!(state.cursor, 0);
        assert_eq!(state.processed, 37);
        assert!(state.last_run.is_some());
        assert_eq!(produced, 9); // 3 assets x (2 derived + 1 regeneration)
        assert_eq!(saved, 3000);
        assert_eq!(*workload.processed.lock().unwrap(), vec![2, 20, 36]);
    }

    #[test]
    fn test_pause_resume_preserves_progress() {
        let workload = FakeWorkload::new(37);
        let gate = StaticGate::open();
        let state = started(&workload);

        let state = run_chunk(&state, &gate, &workload, Utc::now()).state;
        let paused = pause(&state).state;

        // chunks are no-ops while paused
        let t = run_chunk(&paused, &gate, &workload, Utc::now());
        assert!(t.result.result.done);
        assert!(!t.changed);

        let resumed = start(&paused, &gate, &workload).state;
        assert_eq!(resumed.status, BatchStatus::Running);
        assert_eq!((resumed.cursor, resumed.processed, resumed.total), (15, 15, 37));

        let mut state = resumed;
        while state.status == BatchStatus::Running {
            state = run_chunk(&state, &gate, &workload, Utc::now()).state;
        }
        let visited = workload.visited.lock().unwrap().clone();
        assert_eq!(visited, (1..=37).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunk_noop_when_gate_closed() {
        let workload = FakeWorkload::new(10).with_work(1..=10);
        let state = started(&workload);
        let t = run_chunk(&state, &StaticGate { ready: false, enabled: true }, &workload, Utc::now());
        assert_eq!(t.result.result, ChunkResult { processed: 0, done: true, errors: vec![] });
        assert_eq!(t.state, state);
        assert!(workload.visited.lock().unwrap().is_empty());
    }

    #[test]
    fn test_errors_capped_but_progress_continues() {
        let workload = FakeWorkload { errors_per_asset: 2, ..FakeWorkload::new(20) }.with_work(1..=20);
        let state = started(&workload);
        let t = run_chunk(&state, &StaticGate::open(), &workload, Utc::now());

        assert_eq!(t.result.result.errors.len(), MAX_CHUNK_ERRORS);
        assert_eq!(t.result.result.errors[0], "asset 1 error 0");
        assert_eq!(t.state.cursor, 15);
        assert_eq!(t.result.assets_optimized, 0);
        assert!(!t.result.result.done);
    }

    #[test]
    fn test_empty_page_finalizes() {
        let workload = FakeWorkload::new(0);
        let state = BatchState { status: BatchStatus::Running, cursor: 0, total: 10, processed: 4, last_run: None };
        let t = run_chunk(&state, &StaticGate::open(), &workload, Utc::now());
        assert!(t.result.result.done);
        assert_eq!(t.continuation, Continuation::Cancel);
        assert_eq!(t.state.status, BatchStatus::Idle);
        assert_eq!(t.state.cursor, 0);
    }

    #[test]
    fn test_listing_failure_keeps_pass_running() {
        let workload = FakeWorkload { fail_listing: true, ..FakeWorkload::new(10) };
        let state = BatchState { status: BatchStatus::Running, cursor: 0, total: 10, processed: 0, last_run: None };
        let t = run_chunk(&state, &StaticGate::open(), &workload, Utc::now());
        assert!(!t.result.result.done);
        assert_eq!(t.result.result.errors.len(), 1);
        assert_eq!(t.continuation, Continuation::Schedule);
        assert_eq!(t.state, state);
    }

    #[test]
    fn test_population_shrinking_mid_pass_ends_early() {
        let workload = FakeWorkload::new(20);
        let mut state = started(&workload);
        state.total = 40; // snapshot taken before deletions
        let t = run_chunk(&state, &StaticGate::open(), &workload, Utc::now());
        assert!(!t.result.result.done);
        let t = run_chunk(&t.state, &StaticGate::open(), &workload, Utc::now());
        assert!(t.result.result.done); // short page
        assert_eq!(t.state.processed, 20);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // every asset is visited exactly once per pass, in order, whatever the
        // population size and wherever pauses fall
        #[test]
        fn prop_pass_visits_each_asset_once(
            population in 0u64..80,
            pauses in prop::collection::vec(any::<bool>(), 0..10),
        ) {
            let workload = FakeWorkload::new(population);
            let gate = StaticGate::open();
            let mut state = started(&workload);
            let mut chunks = 0u64;
            let mut pauses = pauses.into_iter();

            while state.status != BatchStatus::Idle {
                if pauses.next().unwrap_or(false) {
                    state = pause(&state).state;
                    state = start(&state, &gate, &workload).state;
                }
                state = run_chunk(&state, &gate, &workload, Utc::now()).state;
                chunks += 1;
                prop_assert!(chunks <= population / BATCH_SIZE as u64 + 1);
            }

            prop_assert_eq!(state.cursor, 0);
            prop_assert_eq!(state.processed, population);
            let visited = workload.visited.lock().unwrap().clone();
            prop_assert_eq!(visited, (1..=population).collect::<Vec<_>>());
        }
    }
}
