//! # Caseflow Server
//!
//! Imaging intake and annotation work assignment.
//!
//! The process watches an inbox directory for DICOM files, copies each one
//! into a content store, catalogs it under its case and keeps exactly one
//! work item per case. Annotators pull work items through time-bounded
//! leases; an abandoned lease is reclaimed the next time anyone asks for
//! work.
//!
//! ## Commands
//!
//! - no subcommand: run the intake service until Ctrl-C
//! - `db migrate`: apply catalog migrations and exit
//! - `ingest <path>`: run one file through the pipeline and print the outcome

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use caseflow_config::{Config, ConfigLoad, ConfigLoader};
use caseflow_core::{DicomExtractor, IngestOutcome};
use caseflow_server::infra::bootstrap::{
    build_context, connect_pool, open_catalog, run_migrations,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "caseflow-server")]
#[command(about = "Imaging intake service with lease-based annotation work queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Inbox directory (overrides config)
    #[arg(long, global = true)]
    inbox: Option<PathBuf>,

    /// Keep the catalog in memory instead of PostgreSQL
    #[arg(long, env = "CASEFLOW_EPHEMERAL", default_value_t = false, global = true)]
    ephemeral: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
    /// Run a single file through the ingestion pipeline and exit
    Ingest {
        /// File inside the inbox
        path: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Db(DbCommand::Migrate) => {
                run_db_migrate(&cli.serve).await?;
                return Ok(());
            }
            Command::Ingest { path } => {
                run_ingest_once(&cli.serve, path).await?;
                return Ok(());
            }
        }
    }

    run_server(cli.serve).await
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let url = config
        .database
        .url
        .as_deref()
        .context("no database URL configured; set DATABASE_URL")?;
    let pool = connect_pool(url)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

async fn run_ingest_once(args: &ServeArgs, path: PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(load_runtime_config(args)?);
    let handle = open_catalog(&config, args.ephemeral).await?;
    let ctx = build_context(
        Arc::clone(&config),
        Arc::clone(&handle.catalog),
        Arc::new(DicomExtractor::new()),
        None,
    );

    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("failed to resolve current directory")?
            .join(path)
    };

    ctx.ingestion()
        .pipeline()
        .store()
        .ensure_root()
        .await
        .context("content store is not writable")?;
    let outcome = ctx
        .ingest_now(&path)
        .await
        .with_context(|| format!("failed to ingest {}", path.display()))?;
    handle.close().await;

    println!("{}", describe(&outcome));
    match outcome {
        IngestOutcome::Rejected { .. } | IngestOutcome::Retry { .. } => {
            anyhow::bail!("{} was not ingested", path.display())
        }
        _ => Ok(()),
    }
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = Arc::new(load_runtime_config(&args)?);
    let handle = open_catalog(&config, args.ephemeral).await?;
    let ctx = build_context(
        Arc::clone(&config),
        Arc::clone(&handle.catalog),
        Arc::new(DicomExtractor::new()),
        None,
    );

    let ingestion = ctx.ingestion();
    ingestion
        .start()
        .await
        .context("failed to start ingestion service")?;
    info!(
        inbox = %config.inbox().display(),
        store = %config.store_root().display(),
        lease_secs = config.lease.lease_duration_secs,
        "caseflow server running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    ingestion.stop().await;
    handle.close().await;
    info!("caseflow server stopped");
    Ok(())
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = args.config.clone() {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(inbox) = args.inbox.clone() {
        config.paths.inbox = inbox;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,ingest=info,lease=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "loaded configuration file");
    }

    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    config
        .ensure_directories()
        .context("failed to create data directories")?;

    Ok(config)
}

fn describe(outcome: &IngestOutcome) -> String {
    match outcome {
        IngestOutcome::Ingested {
            case_id,
            item_id,
            stored_path,
            case_created,
        } => format!(
            "ingested item {item_id} into {} case {case_id} at {}",
            if *case_created { "new" } else { "existing" },
            stored_path.display()
        ),
        IngestOutcome::Duplicate { item_id } => {
            format!("item {item_id} is already cataloged")
        }
        IngestOutcome::Rejected { stage, reason } => {
            format!("rejected after {stage}: {reason}")
        }
        IngestOutcome::Retry { stage, error } => {
            format!("transient failure after {stage}: {error}")
        }
        IngestOutcome::Vanished => "file disappeared before it could be read".into(),
        IngestOutcome::Deferred => "file is already being processed".into(),
    }
}
