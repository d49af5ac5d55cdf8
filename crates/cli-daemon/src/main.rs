use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use log::{debug, error, info, warn, LevelFilter};
use optimizer::{
    batch::{ChunkResult, StartOutcome},
    config::OptimizerConfig,
    encode::Transcoder,
    engine::{BatchEngine, StatusReport},
    gate::{CapabilityGate, EnvironmentGate},
    library::ManifestLibrary,
    process::Optimizer,
    registry::{LocalFs, ResolutionRegistry},
    scan::Scanner,
    schedule::{ContinuationScheduler, FileScheduler},
    state::{BatchStatus, StateStore},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use chrono::Utc;

/// WebP image optimization daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Run the daemon loop (default)
    Run,
    /// Start a batch pass, or resume a paused one
    Start,
    /// Pause the running batch pass after the current chunk
    Pause,
    /// Run one chunk now
    Chunk,
    /// Show batch state and cumulative stats
    Status {
        /// Also walk the library to count assets needing work (slow)
        #[arg(long)]
        counts: bool,
    },
    /// Register new images under the library root and optimize them
    Ingest,
    /// Forget batch state and stats
    Reset {
        /// Also delete the .webp file beside every registered image,
        /// whether or not this tool wrote it
        #[arg(long)]
        purge_derived: bool,
    },
}

/// Everything wired together from one configuration
struct Components {
    cfg: OptimizerConfig,
    registry: Arc<ResolutionRegistry>,
    library: Arc<ManifestLibrary>,
    transcoder: Arc<Transcoder>,
    optimizer: Arc<Optimizer>,
    scheduler: Arc<FileScheduler>,
    engine: Arc<BatchEngine>,
}

impl Components {
    fn build(cfg: OptimizerConfig) -> Self {
        let state_dir = cfg.resolved_state_dir();
        let registry = Arc::new(ResolutionRegistry::new(cfg.resolutions.clone()));
        let library = Arc::new(ManifestLibrary::from_config(&cfg, registry.clone()));
        let transcoder = Arc::new(Transcoder::from_config(&cfg));
        let scanner = Scanner::new(library.clone(), registry.clone(), Arc::new(LocalFs));
        let optimizer = Arc::new(Optimizer::new(scanner, transcoder.clone()));
        let scheduler = Arc::new(FileScheduler::new(state_dir.clone()));
        let gate = Arc::new(EnvironmentGate::new(
            cfg.library_root.clone(),
            state_dir.clone(),
            transcoder.clone(),
            cfg.processing_enabled,
        ));
        let engine = Arc::new(BatchEngine::new(
            StateStore::new(state_dir),
            scheduler.clone(),
            gate,
            optimizer.clone(),
            Duration::from_secs(cfg.continuation_delay_secs),
        ));

        Self { cfg, registry, library, transcoder, optimizer, scheduler, engine }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only raises the default
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    logger.parse_default_env().format_timestamp_secs().init();

    let cfg = OptimizerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let components = Components::build(cfg);

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_daemon(args.config.clone(), components).await,
        Command::Start => {
            let outcome = components.engine.start()?;
            print_start(&outcome, args.json)
        }
        Command::Pause => {
            components.engine.pause()?;
            print_message("Batch paused", args.json)
        }
        Command::Chunk => {
            let engine = components.engine.clone();
            let result = tokio::task::spawn_blocking(move || engine.run_chunk())
                .await
                .context("Chunk task panicked")??;
            print_chunk(&result, args.json)
        }
        Command::Status { counts } => {
            let engine = components.engine.clone();
            let report = tokio::task::spawn_blocking(move || engine.status(counts))
                .await
                .context("Status task panicked")?;
            print_status(&report, args.json)
        }
        Command::Ingest => {
            let summary = tokio::task::spawn_blocking(move || ingest(&components))
                .await
                .context("Ingest task panicked")??;
            print_ingest(&summary, args.json)
        }
        Command::Reset { purge_derived } => {
            let purged = components.engine.reset(purge_derived)?;
            print_message(&format!("State reset; {} derived file(s) removed", purged), args.json)
        }
    }
}

async fn run_daemon(config_path: Option<PathBuf>, components: Components) -> Result<()> {
    let cfg = &components.cfg;
    info!("Image optimizer daemon starting");
    info!("Configuration loaded:");
    info!("  Library root: {}", cfg.library_root.display());
    info!("  Manifest: {}", cfg.resolved_manifest_path().display());
    info!("  State dir: {}", cfg.resolved_state_dir().display());
    info!("  Resolutions: {:?}", components.registry.names());
    info!("  Processing enabled: {}", cfg.processing_enabled);
    let backends = components.transcoder.available_backends();
    if backends.is_empty() {
        warn!("  WebP encoders: none available");
    } else {
        info!("  WebP encoders: {}", backends.join(", "));
    }
    match cfg.rescan_interval_secs {
        Some(secs) => info!("  Rescan interval: {}s", secs),
        None => info!("  Rescan interval: manual only"),
    }

    if cfg.library_root.exists() {
        info!("Library root exists: {}", cfg.library_root.display());
    } else {
        warn!("Library root does not exist: {}", cfg.library_root.display());
    }

    let cleaned = cleanup_orphaned_staging_files(&cfg.library_root).await?;
    if cleaned > 0 {
        info!("Startup recovery: removed {} orphaned staging file(s)", cleaned);
    }
    if components.engine.ensure_continuation()? {
        info!("Startup recovery: re-armed interrupted batch pass");
    }

    let poll = Duration::from_secs(cfg.poll_interval_secs.max(1));
    let rescan = cfg.rescan_interval_secs.map(Duration::from_secs);
    let mut config_mtime = config_path.as_deref().and_then(modified);
    let mut last_auto_start: Option<Instant> = None;

    loop {
        if let Some(path) = config_path.as_deref() {
            let mtime = modified(path);
            if mtime != config_mtime {
                config_mtime = mtime;
                reload_resolutions(path, &components.registry);
            }
        }

        if continuation_due(&components) {
            let engine = components.engine.clone();
            match tokio::task::spawn_blocking(move || engine.run_chunk()).await {
                Ok(Ok(result)) => {
                    for e in &result.errors {
                        warn!("Chunk error: {}", e);
                    }
                    if result.done {
                        info!("Batch pass finished");
                    }
                }
                Ok(Err(e)) => error!("Chunk failed: {:#}", e),
                Err(e) => error!("Chunk task panicked: {}", e),
            }
        }

        if let Some(interval) = rescan {
            let idle = components.engine.status(false).state.status == BatchStatus::Idle;
            let elapsed = last_auto_start.map(|t| t.elapsed() >= interval).unwrap_or(true);
            if idle && elapsed && components.engine.gate().is_open() {
                last_auto_start = Some(Instant::now());
                auto_start(&components).await;
            }
        }

        tokio::time::sleep(poll).await;
    }
}

/// A pending continuation has come due and the gate lets it run.
/// The continuation is only consumed when it will actually run.
fn continuation_due(components: &Components) -> bool {
    let now = Utc::now();
    if !components.scheduler.next_run().map(|at| at <= now).unwrap_or(false) {
        return false;
    }
    if !components.engine.gate().is_open() {
        debug!("Continuation due but processing is not possible; holding it");
        return false;
    }
    match components.scheduler.take_due(now) {
        Ok(due) => due,
        Err(e) => {
            error!("Failed to consume continuation: {:#}", e);
            false
        }
    }
}

/// Periodic trigger: pick up new files, then start a fresh pass
async fn auto_start(components: &Components) {
    let library = components.library.clone();
    match tokio::task::spawn_blocking(move || library.ingest_directory()).await {
        Ok(Ok(ids)) if !ids.is_empty() => info!("Rescan registered {} new image(s)", ids.len()),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Rescan ingest failed: {:#}", e),
        Err(e) => warn!("Rescan task panicked: {}", e),
    }
    match components.engine.start() {
        Ok(outcome) if outcome.success => info!("{}", outcome.message),
        Ok(outcome) => warn!("Periodic start refused: {}", outcome.message),
        Err(e) => error!("Periodic start failed: {:#}", e),
    }
}

/// Only the resolution list is reloaded live; other settings need a restart
fn reload_resolutions(path: &Path, registry: &ResolutionRegistry) {
    match OptimizerConfig::load_config(Some(path)) {
        Ok(cfg) => {
            let names: Vec<&str> = cfg.resolutions.iter().map(|r| r.name.as_str()).collect();
            info!("Configuration changed; resolutions now {:?}", names);
            registry.replace(cfg.resolutions);
        }
        Err(e) => warn!("Ignoring invalid configuration change: {:#}", e),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Remove `.name.part` staging files left by an interrupted encode or resize
async fn cleanup_orphaned_staging_files(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let staging_files = tokio::task::spawn_blocking({
        let root = root.to_path_buf();
        move || {
            walkdir::WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .map(|n| n.starts_with('.') && n.ends_with(".part"))
                        .unwrap_or(false)
                })
                .map(|e| e.into_path())
                .collect::<Vec<_>>()
        }
    })
    .await
    .context("Failed to scan for staging files")?;

    let mut cleaned = 0;
    for path in staging_files {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed orphaned staging file: {}", path.display());
                cleaned += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(cleaned)
}

#[derive(Debug, Default, Serialize)]
struct IngestSummary {
    registered: usize,
    optimized: usize,
    derived_generated: u64,
    bytes_saved: u64,
    errors: Vec<String>,
}

/// On-ingest trigger: register new files, then close their gaps right away
fn ingest(components: &Components) -> Result<IngestSummary> {
    let ids = components.library.ingest_directory()?;
    let mut summary = IngestSummary { registered: ids.len(), ..Default::default() };
    if ids.is_empty() {
        return Ok(summary);
    }
    if !components.engine.gate().is_open() {
        info!("Processing unavailable; {} new image(s) left for the next batch pass", ids.len());
        return Ok(summary);
    }

    for id in ids {
        let outcome = components.optimizer.ingest_asset(id);
        if outcome.did_work() {
            summary.optimized += 1;
        }
        summary.derived_generated += outcome.derived_generated;
        summary.bytes_saved += outcome.bytes_saved;
        summary.errors.extend(outcome.errors);
    }
    Ok(summary)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn print_message(message: &str, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "success": true, "message": message }));
    }
    println!("{}", message);
    Ok(())
}

fn print_start(outcome: &StartOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }
    if outcome.success {
        println!("{}", outcome.message);
    } else {
        eprintln!("Cannot start: {}", outcome.message);
    }
    Ok(())
}

fn print_chunk(result: &ChunkResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    println!(
        "Processed {} item(s){}",
        result.processed,
        if result.done { "; pass complete" } else { "" }
    );
    for e in &result.errors {
        println!("  error: {}", e);
    }
    Ok(())
}

fn print_status(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    let state = &report.state;
    println!("Status:       {}", state.status);
    println!("Progress:     {}/{}", state.processed, state.total);
    println!(
        "Last run:     {}",
        state.last_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    );
    println!(
        "Next chunk:   {}",
        report.next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "not scheduled".to_string())
    );
    println!("Saved:        {}", format_size((report.stats.mb_saved * 1024.0 * 1024.0) as u64, BINARY));
    println!("Optimized:    {} image(s)", report.stats.images_optimized);
    if let Some(total) = report.total_assets {
        println!("Assets:       {}", total);
    }
    if let (Some(needing), Some(done)) = (report.needing_work, report.optimized_assets) {
        println!("Needing work: {}", needing);
        println!("Complete:     {}", done);
    }
    if !report.ready {
        println!("Warning: environment not ready (library root, state dir or encoder missing)");
    } else if !report.processing_enabled {
        println!("Warning: processing is disabled in configuration");
    }
    Ok(())
}

fn print_ingest(summary: &IngestSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    println!("Registered {} new image(s)", summary.registered);
    if summary.optimized > 0 {
        println!(
            "Optimized {} image(s): {} WebP file(s), {} saved",
            summary.optimized,
            summary.derived_generated,
            format_size(summary.bytes_saved, BINARY)
        );
    }
    for e in summary.errors.iter().take(5) {
        println!("  error: {}", e);
    }
    Ok(())
}
