use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use transcoder::{config::TranscodeConfig, finalize, scan, Journal};

/// Remove originals whose AV1 transcode the journal records as successful
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory previously processed by av1batch
    dir: PathBuf,

    /// Actually delete files; without this only reports what would be removed
    #[arg(long)]
    apply: bool,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Completion journal, overrides the configured path
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(journal) = args.journal {
        cfg.journal_path = journal;
    }

    info!("Finalizing directory: {}", args.dir.display());
    if !args.apply {
        info!("Dry run, pass --apply to delete");
    }

    let media = scan::scan_media(&args.dir)
        .with_context(|| format!("Error listing directory: {}", args.dir.display()))?;
    let journal = Journal::open(&cfg.journal_path)
        .with_context(|| format!("Failed to open journal: {}", cfg.journal_path.display()))?;
    let scan = journal
        .read_all()
        .with_context(|| format!("Error reading transcode journal: {}", cfg.journal_path.display()))?;
    info!("Loaded {} journal record(s)", scan.entries.len());

    finalize::finalize(&media, &scan, !args.apply);
    Ok(())
}
