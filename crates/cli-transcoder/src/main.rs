use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use transcoder::{
    config::TranscodeConfig,
    scan, FfmpegTransformer, FfprobeInspector, Journal, LockRegistry, Orchestrator,
};

/// Transcode every media file under a directory to AV1, once, across any number of instances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to scan for media files
    input_dir: PathBuf,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Completion journal, overrides the configured path
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Attempt jobs whose last journal record is a failure
    #[arg(long)]
    retry_failed: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(journal) = args.journal {
        cfg.journal_path = journal;
    }
    if args.retry_failed {
        cfg.retry_failed = true;
    }

    info!("AV1 batch transcoder starting (pid {})", std::process::id());
    info!("  Input directory: {}", args.input_dir.display());
    info!("  Journal: {}", cfg.journal_path.display());
    info!("  Lock registry: {}", cfg.lock_registry_path.display());
    info!("  Min bit rate: {} bps", cfg.min_bitrate_bps);
    if cfg.retry_failed {
        warn!("Retrying jobs with recorded failures");
    }

    // Coordination primitives must be usable before any job starts
    let journal = Journal::open(&cfg.journal_path)
        .with_context(|| format!("Failed to set up journal: {}", cfg.journal_path.display()))?;
    let registry = LockRegistry::open(&cfg.lock_registry_path)
        .with_context(|| format!("Failed to set up lock registry: {}", cfg.lock_registry_path.display()))?;
    debug!("Holding locks as {}", registry.owner());

    let input_dir = args.input_dir.clone();
    let candidates = tokio::task::spawn_blocking(move || scan::scan_media(&input_dir))
        .await
        .context("Directory scan task failed")?
        .with_context(|| format!("Failed to scan input directory: {}", args.input_dir.display()))?;
    info!("Found {} video files", candidates.len());

    let mut orchestrator = Orchestrator::new(
        &cfg,
        registry,
        journal,
        FfprobeInspector::new(&cfg.ffprobe_bin),
        FfmpegTransformer::new(&cfg),
    );
    let summary = orchestrator.run(&candidates).await;

    if summary.failed > 0 || summary.abandoned > 0 {
        warn!(
            "{} job(s) failed and {} were abandoned; see the journal at {}",
            summary.failed,
            summary.abandoned,
            cfg.journal_path.display()
        );
    }
    info!("All items processed");
    Ok(())
}
