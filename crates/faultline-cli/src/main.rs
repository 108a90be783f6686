#![forbid(unsafe_code)]

//! **faultline-cli** – Command-line entry point for the Faultline recorder.
//!
//! `faultline recorder <bind-uri> <database-uri>` binds the transport
//! socket, opens (or creates) the SQLite store, and runs the ingest loop
//! until a termination signal arrives. The process exits 0 after a clean
//! signal shutdown and nonzero on unrecoverable transport or store errors.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faultline_recorder::{Recorder, RecorderConfig};
use faultline_store_core::EventStore;
use faultline_store_sqlite::SqliteStore;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "faultline")]
#[command(about = "Faultline - error and event telemetry recorder")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recorder with the SQLite backend
    Recorder {
        /// Address to bind the transport socket, e.g. 127.0.0.1:5555
        bind_uri: String,
        /// Database location: a path, sqlite://<path>, or :memory:
        database_uri: String,
    },
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Recorder {
            bind_uri,
            database_uri,
        } => run_recorder(bind_uri, database_uri).await,
    }
}

async fn run_recorder(bind_uri: String, database_uri: String) -> Result<()> {
    let store = open_store(&database_uri).await?;
    let recorder = Recorder::bind(RecorderConfig::new(bind_uri), store).await?;
    let signal = recorder.run().await?;
    info!(%signal, "faultline recorder shut down cleanly");
    Ok(())
}

async fn open_store(database_uri: &str) -> Result<Arc<dyn EventStore>> {
    let path = database_path(database_uri);
    let store = if path == ":memory:" {
        SqliteStore::in_memory().await?
    } else {
        SqliteStore::open(path).await?
    };
    Ok(Arc::new(store))
}

/// Accept plain paths alongside `sqlite:`-style URIs.
fn database_path(uri: &str) -> &str {
    uri.strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri)
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_path_accepts_uri_and_plain_forms() {
        assert_eq!(database_path("sqlite://var/faultline.db"), "var/faultline.db");
        assert_eq!(database_path("sqlite::memory:"), ":memory:");
        assert_eq!(database_path("faultline.db"), "faultline.db");
        assert_eq!(database_path(":memory:"), ":memory:");
    }

    #[test]
    fn test_cli_parses_recorder_command() {
        let cli = Cli::parse_from([
            "faultline",
            "recorder",
            "127.0.0.1:5555",
            "sqlite://faultline.db",
        ]);
        match cli.command {
            Commands::Recorder {
                bind_uri,
                database_uri,
            } => {
                assert_eq!(bind_uri, "127.0.0.1:5555");
                assert_eq!(database_uri, "sqlite://faultline.db");
            }
        }
    }
}
