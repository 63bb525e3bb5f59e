use anyhow::{Context, Result};
use bksched::config::AppConfig;
use bksched::context::AppContext;
use bksched::core::notifications::create_notifier;
use bksched::core::{Orchestrator, OrchestratorError, ShellExecutor, SystemClock};
use bksched::db::{self, SqliteLockManager, SqliteStore};
use bksched::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bksched")]
#[command(about = "Scheduled multi-step backup jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling pass over all enabled templates
    Run(RunArgs),
    /// Run scheduling passes forever at a fixed interval
    Daemon(RunArgs),
    /// Show the latest job of every enabled template
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the audit trail of a job
    Logs { job_id: String },
}

#[derive(Args, Serialize)]
struct RunArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    staging_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    daemon_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Run(args) | Commands::Daemon(args) => {
            AppConfig::new(cli.config.as_deref(), Some(args))?
        }
        _ => AppConfig::new(cli.config.as_deref(), None::<&RunArgs>)?,
    };

    logging::init(LogConfig::from(&config));
    let conn = db::init(&config.database_path).await?;

    match cli.command {
        Commands::Run(_) => {
            let ctx = build_context(config, conn).await?;
            run_once(&Orchestrator::new(ctx))
                .await
                .context("Scheduling run failed")?
        }
        Commands::Daemon(_) => {
            let ctx = build_context(config, conn).await?;
            run_daemon(ctx).await?
        }
        Commands::Status { json } => run_status(&conn, json).await?,
        Commands::Logs { job_id } => run_logs(&conn, job_id).await?,
    }

    Ok(())
}

async fn build_context(config: AppConfig, conn: Connection) -> Result<AppContext> {
    db::templates::sync_catalog(
        &conn,
        config.repositories.clone(),
        config.hosts.clone(),
        config.templates.clone(),
    )
    .await?;

    let executor = Arc::new(ShellExecutor::new(config.tools.shell.clone()));
    let notifier = create_notifier(&config.notifications);

    Ok(AppContext::new(
        config,
        Arc::new(SqliteStore::new(conn.clone())),
        executor,
        Arc::new(SqliteLockManager::new(conn)),
        notifier,
        Arc::new(SystemClock),
    ))
}

async fn run_once(orchestrator: &Orchestrator) -> Result<(), OrchestratorError> {
    let summary = orchestrator.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    Ok(())
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    let interval_secs = ctx.config.daemon_interval_secs.max(60);
    let orchestrator = Orchestrator::new(ctx);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    info!(interval_secs, "bksched daemon starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orchestrator.run().await {
                    Ok(_) => {}
                    Err(OrchestratorError::LockUnavailable(name)) => {
                        warn!(lock = %name, "Another run is in progress, skipping this tick");
                    }
                    Err(e) => error!(error = %e, "Scheduling run failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_status(conn: &Connection, json: bool) -> Result<()> {
    let statuses = db::jobs::latest_per_template(conn).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    for status in statuses {
        match &status.job {
            Some(job) => println!(
                "{:<24} {:<22} {:<12} {}  {}",
                status.slug,
                status.source_type,
                job.state,
                job.updated_at.format("%Y-%m-%d %H:%M"),
                job.id
            ),
            None => println!("{:<24} {:<22} {:<12}", status.slug, status.source_type, "-"),
        }
    }
    Ok(())
}

async fn run_logs(conn: &Connection, job_id: String) -> Result<()> {
    if db::jobs::get(conn, job_id.clone()).await?.is_none() {
        anyhow::bail!("Job not found: {}", job_id);
    }

    for entry in db::jobs::logs(conn, job_id).await? {
        println!(
            "{} {:<7} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.level.as_str(),
            entry.message
        );
    }
    Ok(())
}
