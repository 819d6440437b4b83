//! Micrograph Process CLI - grid-scan post-processing
//!
//! Command-line interface for the plugin-based micrograph pipeline.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;
mod settings;

use commands::process::ProcessCommand;

#[derive(Parser)]
#[command(
    name = "micrograph-process",
    version,
    about = "Fuse, correct and hand off tiled micrograph scans",
    long_about = "Turns a directory of grid-scan tiles (optionally captured at several exposures,\n\
                  focus heights and repeated frames) into one corrected image per grid cell,\n\
                  checks the grid is complete and hands the result to the uploader.",
    after_help = "EXAMPLES:\n  \
                  # List all available plugins\n  \
                  micrograph-process plugins\n\n  \
                  # Process two scans without uploading\n  \
                  micrograph-process process --no-upload scans/2024-05-01 scans/2024-05-02\n\n  \
                  # Process every scan under scan_root that has not been uploaded yet\n  \
                  micrograph-process --config micrograph.yaml process --fix --best-effort"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./micrograph.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process scan directories
    Process(ProcessCommand),

    /// List available plugins
    Plugins,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG, when set, refines the level picked here
    let default_level = match &cli.command {
        Commands::Plugins => LevelFilter::WARN,
        Commands::Process(_) if cli.verbose => LevelFilter::DEBUG,
        Commands::Process(_) => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Process(cmd) => cmd.execute(cli.config.as_deref()),
        Commands::Plugins => commands::plugins::list_plugins(cli.config.as_deref()),
    }
}
