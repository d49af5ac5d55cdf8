pub mod asset;
pub mod batch;
pub mod config;
pub mod encode;
pub mod engine;
pub mod gate;
pub mod library;
pub mod process;
pub mod registry;
pub mod scan;
pub mod schedule;
pub mod state;

pub use asset::{Asset, AssetId, AssetStore};
pub use batch::{ChunkResult, StartOutcome, Workload, BATCH_SIZE};
pub use config::{OptimizerConfig, ResolutionSpec};
pub use encode::{EncodeError, Encoder, Transcoder};
pub use engine::{BatchEngine, StatusReport};
pub use gate::{CapabilityGate, EnvironmentGate};
pub use library::ManifestLibrary;
pub use process::{Optimizer, ProcessOutcome};
pub use registry::{derived_path, worth_serving, LocalFs, ResolutionRegistry};
pub use scan::{GapReport, Scanner};
pub use schedule::{ContinuationScheduler, FileScheduler};
pub use state::{AggregateStats, BatchState, BatchStatus, StateStore};
