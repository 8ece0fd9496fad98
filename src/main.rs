//! trialstab - Clinical trial early-stop metrics
//!
//! Usage:
//!   trialstab ingest --file artifacts/raw_ctgov_studies.ndjson
//!   trialstab batches
//!   trialstab run [--dry-run]
//!   trialstab check
//!   trialstab config [--write trialstab.toml [--force]]

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trial_stability::config::{PipelineConfig, CONFIG_PATH_ENV, DB_PATH_ENV};
use trial_stability::ingest::{import_studies, read_studies};
use trial_stability::selector::summarize_batches;
use trial_stability::publish::{check_published, CheckOutcome};
use trial_stability::{Pipeline, SqliteBatchStore, SqlitePublisher};

/// Sponsor early-stop metrics over clinical trial registry snapshots
#[derive(Parser, Debug)]
#[command(name = "trialstab")]
#[command(about = "Normalize registry snapshots and publish per-sponsor early-stop rates")]
struct Cli {
    /// Path to the SQLite database (overrides config)
    #[arg(short, long, env = DB_PATH_ENV)]
    db_path: Option<PathBuf>,

    /// Path to a TOML config file
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import a dump file (NDJSON, JSON array or API page) as a new batch
    Ingest {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List committed batches, newest first
    Batches,

    /// Run the pipeline on the latest batch
    Run {
        /// Validate without publishing
        #[arg(long)]
        dry_run: bool,
    },

    /// Query published metrics for rates outside [0, 1]
    Check,

    /// Print the effective config as TOML, or write it to a file
    Config {
        /// Destination file
        #[arg(long)]
        write: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long, requires = "write")]
        force: bool,
    },
}

fn main() -> ExitCode {
    load_env();
    init_tracing();

    match run_cli(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let mut config = PipelineConfig::resolve(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.store.db_path = db_path;
    }
    let db_path = config.store.db_path.clone();

    match cli.command {
        Commands::Ingest { file } => {
            let store = open_store(&db_path, &config)?;
            let studies = read_studies(&file)
                .with_context(|| format!("Failed to read studies from {}", file.display()))?;
            match import_studies(&store, studies, Utc::now())? {
                Some(commit) => println!("{}", serde_json::to_string(&commit)?),
                None => println!("{{\"batch_id\":null,\"record_count\":0}}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Batches => {
            let store = open_store(&db_path, &config)?;
            let summaries = summarize_batches(&store)?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { dry_run } => {
            let store = Arc::new(open_store(&db_path, &config)?);
            let publisher = Arc::new(open_publisher(&db_path)?);
            let report = Pipeline::new(store, publisher, config).run(!dry_run)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.passed() {
                info!("Run passed (published: {})", report.published);
                Ok(ExitCode::SUCCESS)
            } else {
                error!("Run failed guardrails; nothing published");
                Ok(ExitCode::from(1))
            }
        }
        Commands::Check => {
            let publisher = open_publisher(&db_path)?;
            match check_published(&publisher)? {
                CheckOutcome::Clean { rows } => {
                    println!("[]");
                    info!("early_stop_rate within [0, 1] for all {} published rows", rows);
                    Ok(ExitCode::SUCCESS)
                }
                CheckOutcome::OutOfRange(bad) => {
                    println!("{}", serde_json::to_string_pretty(&bad)?);
                    error!("{} published rows have early_stop_rate outside [0, 1]", bad.len());
                    Ok(ExitCode::from(1))
                }
                CheckOutcome::NothingPublished => {
                    error!("No published metric rows; cannot validate");
                    Ok(ExitCode::from(2))
                }
            }
        }
        Commands::Config { write, force } => match write {
            Some(path) => {
                config.save(&path, force)?;
                info!("Wrote config to {}", path.display());
                Ok(ExitCode::SUCCESS)
            }
            None => {
                print!("{}", config.to_toml()?);
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

fn open_store(db_path: &Path, config: &PipelineConfig) -> Result<SqliteBatchStore> {
    Ok(SqliteBatchStore::open(db_path)
        .with_context(|| format!("Failed to open batch store at {}", db_path.display()))?
        .with_page_size(config.store.scan_page_size))
}

fn open_publisher(db_path: &Path) -> Result<SqlitePublisher> {
    SqlitePublisher::open(db_path)
        .with_context(|| format!("Failed to open publisher at {}", db_path.display()))
}

/// Initialize tracing; `RUST_LOG` overrides the default filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trial_stability=info,trialstab=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
