//! Run uploads through the pipeline from the command line.
//!
//! Records are kept in memory and previews are written below the configured blob root.
//! One JSON report per file is printed to stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{LevelFilter, error};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use trailblazer::blob::LocalBlobStore;
use trailblazer::persistence::MemoryStore;
use trailblazer::{Config, Pipeline, Upload};

#[derive(Parser)]
#[command(name = "trailblazer-ingest")]
#[command(about = "Standardize FITS uploads and render their previews", long_about = None)]
struct Cli {
    /// FITS files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Configuration file, overriding $TRAILBLAZER_CONFIG and ~/.trail/config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configuration
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(level: LevelFilter) {
    let config = ConfigBuilder::new().set_target_level(LevelFilter::Off).build();
    if TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto).is_err() {
        eprintln!("A logger is already installed.");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging(LevelFilter::Info);
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(if cli.verbose { LevelFilter::Debug } else { config.log_level_filter() });

    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(LocalBlobStore::new(&config.blob_root));
    let pipeline = match Pipeline::from_config(&config, store, blobs) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut failed = 0;
    for path in &cli.files {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Cannot read {}: {e}", path.display());
                failed += 1;
                continue;
            }
        };
        let report = pipeline.process(Upload::new(path.to_string_lossy(), bytes));
        if !report.is_persisted() {
            failed += 1;
        }
        match serde_json::to_string(&report) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Cannot serialize the report of {}: {e}", path.display()),
        }
    }

    if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
