use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::task::spawn;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use broker_server::config::{self, Config, LogFormat};
use broker_server::jobs;
use broker_server::StateInner;

/// Sandbox pool broker.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    ///
    /// This overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,

    /// Whether to enable tokio-console.
    ///
    /// The console server will listen on its default port.
    #[clap(long)]
    tokio_console: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run the API server and the background loops.
    Monolithic,

    /// Run the API server only.
    ApiServer,

    /// Run the background loops only.
    Worker,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Run one upstream sync then exit.
    SyncOnce,

    /// Run one cleanup pass then exit.
    CleanupOnce,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let config = match config::load_config(opts.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config, opts.tokio_console);
    dump_version();

    match opts.mode {
        ServerMode::Monolithic => {
            broker_server::run_migrations(config.clone()).await?;
            broker_server::run_api_server(opts.listen, config, true).await?;
        }
        ServerMode::ApiServer => {
            broker_server::run_api_server(opts.listen, config, false).await?;
        }
        ServerMode::Worker => {
            broker_server::run_worker(config).await?;
        }
        ServerMode::DbMigrations => {
            broker_server::run_migrations(config).await?;
        }
        ServerMode::SyncOnce => {
            let state = StateInner::new(config).await;
            let outcome = jobs::sync::run_sync_once(&state).await?;
            eprintln!(
                "Synced {} sandboxes, marked {} stale in {}ms",
                outcome.synced, outcome.marked_stale, outcome.duration_ms
            );
        }
        ServerMode::CleanupOnce => {
            let state = StateInner::new(config).await;
            let outcome = jobs::cleanup::run_cleanup_once(&state).await?;
            eprintln!(
                "Deleted {} sandboxes, {} failed in {}ms",
                outcome.deleted, outcome.failed, outcome.duration_ms
            );
        }
        ServerMode::CheckConfig => {
            eprintln!("Config looks good!");
        }
    }

    Ok(())
}

fn init_logging(config: &Config, tokio_console: bool) {
    let env_filter = EnvFilter::from_default_env();

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(env_filter).boxed(),
    };

    let error_layer = ErrorLayer::default();

    let console_layer = if tokio_console {
        let (layer, server) = console_subscriber::ConsoleLayer::new();
        spawn(server.serve());
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(error_layer)
        .with(console_layer)
        .init();

    if tokio_console {
        eprintln!("Note: tokio-console is enabled");
    }
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("Broker Server {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("Broker Server {} (release)", env!("CARGO_PKG_VERSION"));
}
