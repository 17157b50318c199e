mod audit;
mod cli;
mod config;
mod error;
mod events;
mod identity;
mod logging;
mod roles;
mod router;
mod rpc;
mod server;
mod skills;
mod strategy;
mod upstream;

use crate::config::Config;
use crate::router::RouterCore;
use crate::upstream::UpstreamPool;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "toolgate", version)]
#[command(about = "Toolgate, a zero-trust routing gateway for agent tool servers", long_about = None)]
struct Cli {
    /// Config file path. Defaults to ./toolgate.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve JSON-RPC on stdin/stdout (the default).
    Serve,
    /// Print the role catalogue derived from the skill manifest.
    Roles {
        /// Include roles marked inactive.
        #[arg(long, default_value_t = false)]
        include_inactive: bool,
    },
    /// Validate configuration surfaces and exit non-zero on problems.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = Config::load_with_path(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        (Config::default(), None)
    });

    // Lightweight subcommands run without tracing.
    match &cli.cmd {
        Some(Command::Roles { include_inactive }) => {
            return cli::roles_cmd(&config, *include_inactive);
        }
        Some(Command::Check) => {
            return cli::check_cmd(&config, config_path.as_deref());
        }
        Some(Command::Serve) | None => {}
    }

    // Serving: stdout belongs to the JSON-RPC stream, so console logs
    // go to stderr and are dropped entirely in silent mode.
    let log_dir = match logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
        suppress_console: config::silent_mode(),
    }) {
        Ok(path) => Some(path),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            None
        }
    };

    tracing::info!("--- Toolgate Startup ---");
    if let Some(path) = config_path.as_ref() {
        tracing::info!("Config File: {}", path.display());
    } else {
        tracing::info!("Config File: (default)");
    }
    if let Some(dir) = log_dir.as_ref() {
        tracing::info!("Log Directory: {}", dir.display());
    }

    let (events_tx, events_rx) = events::channel();
    tokio::spawn(events::log_events(events_rx));

    let pool = Arc::new(UpstreamPool::new(
        events_tx.clone(),
        Duration::from_secs(config.gateway.request_timeout_secs),
    ));
    let table = config.resolve_upstreams()?;
    tracing::info!("Upstreams configured: {}", table.len());
    for name in table.keys() {
        tracing::info!("  - {}", name);
    }
    pool.load_from_config(&table).await;

    let router = Arc::new(RouterCore::new(config.clone(), Arc::clone(&pool), events_tx));
    router.initialize().await?;
    let state = router.state().await;
    tracing::info!(
        "Roles: {} | Upstreams: {} | Session: {}",
        state.roles.len(),
        state.upstreams.len(),
        state.session_id
    );

    // SIGHUP reloads the skill manifest and identity overlay in place.
    #[cfg(unix)]
    {
        let reload_router = Arc::clone(&router);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("SIGHUP handler unavailable: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                tracing::info!("SIGHUP received; reloading role catalogue");
                if let Err(e) = reload_router.reload_roles().await {
                    tracing::warn!("Reload failed: {}", e);
                }
            }
        });
    }

    let serve_router = Arc::clone(&router);
    let serve_config = config.clone();
    tokio::select! {
        result = server::serve_stdio(serve_router, &serve_config) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down upstreams");
            router.stop_servers().await;
        }
    }

    Ok(())
}
