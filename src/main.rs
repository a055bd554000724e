use anyhow::Result;
use clap::{Parser, Subcommand};
use flightview::config::AppConfig;
use std::path::PathBuf;

mod commands;

use commands::IngestOptions;

#[derive(Parser, Debug)]
#[command(
    name = "flightview",
    version,
    about = "Track aircraft inside a geofence from OpenSky and view them from a terminal"
)]
struct Cli {
    /// Optional TOML config file; environment variables take precedence
    #[arg(long, global = true, env = "FLIGHTVIEW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll OpenSky and upsert aircraft inside the geofence
    Ingest {
        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
        /// Keep state in memory; nothing is written to the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the most recently updated aircraft
    View {
        /// Print one frame and exit
        #[arg(long)]
        once: bool,
        /// Number of rows to show (default VIEW_LIMIT or 10)
        #[arg(long)]
        limit: Option<i64>,
        /// Seconds between refreshes (default VIEW_REFRESH or 5)
        #[arg(long)]
        refresh: Option<u64>,
    },
    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    flightview::logging::init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Ingest { once, dry_run } => {
            commands::handle_ingest(&config, IngestOptions { once, dry_run }).await
        }
        Command::View {
            once,
            limit,
            refresh,
        } => commands::handle_view(&config, once, limit, refresh).await,
        Command::Migrate => commands::handle_migrate(&config).await,
    }
}
