//! Field task service CLI.
//!
//! Opens the task database, runs the outbox relay, and exposes small
//! operational views (backlog, history, stats) for diagnostics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldtask::broker::LogBroker;
use fieldtask::config::Config;
use fieldtask::db::Database;
use fieldtask::relay::OutboxRelay;
use fieldtask::types::{LifecycleAction, OutboxStatus};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "fieldtask", version, about = "Field task lifecycle service")]
struct Cli {
    /// Log destination: 0/off, 1/stdout, 2/stderr, or a file path.
    #[arg(long, default_value = "stderr")]
    log: String,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to a config file (default: .fieldtask/config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the database path.
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and run migrations.
    Init,
    /// Run the outbox relay until interrupted.
    Relay,
    /// Show the outbox backlog, optionally filtered by status.
    Backlog {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the assignment history for a task.
    History {
        /// Task public id.
        task: String,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Show aggregate task statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on --log option
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match cli.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };

    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.clone();
    }

    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)?;

    match cli.command {
        Command::Init => {
            info!(path = %config.server.db_path.display(), "database initialized");
        }
        Command::Relay => {
            let broker = Arc::new(LogBroker);
            let relay = OutboxRelay::new(db, broker, config.relay.to_relay_config());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });

            relay.run(shutdown_rx).await;
        }
        Command::Backlog { status } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    OutboxStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown outbox status: {s}"))?,
                ),
                None => None,
            };
            let backlog = db.outbox_backlog(status)?;
            println!("{}", serde_json::to_string_pretty(&backlog)?);
        }
        Command::History {
            task,
            action,
            actor,
        } => {
            let action = match action.as_deref() {
                Some(s) => Some(
                    LifecycleAction::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown action: {s}"))?,
                ),
                None => None,
            };
            let history = db.task_history(&task, action, actor.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Command::Stats => {
            let stats = db.task_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
