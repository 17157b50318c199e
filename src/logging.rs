use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_RETENTION_DAYS: u64 = 7;
const LOG_FILE_PREFIX: &str = "toolgate";

pub struct LoggingSettings<'a> {
    pub level: Option<&'a str>,
    pub directory: Option<&'a str>,
    pub retention_days: Option<u64>,
    /// When the gateway serves JSON-RPC on its own stdout (stdio
    /// transport) or runs silently, nothing may be printed to the
    /// console; file logging stays on.
    pub suppress_console: bool,
}

pub fn setup_tracing_with_settings(settings: LoggingSettings<'_>) -> Result<PathBuf> {
    let log_dir = resolve_log_dir(settings.directory)?;
    let retention_days = settings
        .retention_days
        .unwrap_or(DEFAULT_RETENTION_DAYS)
        .max(1);
    if let Err(e) = prune_stale_logs(&log_dir, retention_days) {
        eprintln!("Log pruning skipped: {e}");
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow!("Logging already initialized. Cannot setup logging multiple times."))?;

    // Second-level timestamp precision to keep logs readable.
    let time_format = ChronoUtc::new("%Y-%m-%dT%H:%M:%S".to_string());

    // Console output goes to stderr: stdout belongs to the JSON-RPC
    // stream in stdio mode.
    let console_layer = if settings.suppress_console {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .compact()
                .with_timer(time_format.clone()),
        )
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact()
        .with_timer(time_format);

    let default_filter = || {
        let base = settings.level.unwrap_or("info");
        EnvFilter::new(format!(
            "toolgate={level},reqwest=warn,hyper=warn,hyper_util=warn,mio=warn",
            level = base
        ))
    };

    // When level is explicitly set, override RUST_LOG; otherwise, use
    // RUST_LOG first, then default.
    let filter = if let Some(level) = settings.level {
        EnvFilter::try_new(format!(
            "toolgate={level},reqwest=warn,hyper=warn,hyper_util=warn,mio=warn"
        ))
        .unwrap_or_else(|_| default_filter())
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(env_filter) => env_filter,
            Err(_) => default_filter(),
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(log_dir)
}

/// Where gateway logs land: the configured directory (`~` refers to the
/// invoking user's home), else `$TOOLGATE_HOME/logs`, else
/// `~/.toolgate/logs`, else `./logs` for homeless environments.
fn resolve_log_dir(configured: Option<&str>) -> Result<PathBuf> {
    let dir = match configured {
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(path)),
            None => PathBuf::from(path),
        },
        None => {
            let home_override = std::env::var("TOOLGATE_HOME")
                .ok()
                .filter(|v| !v.trim().is_empty());
            match home_override {
                Some(home) => PathBuf::from(home).join("logs"),
                None => dirs::home_dir()
                    .map(|home| home.join(".toolgate").join("logs"))
                    .unwrap_or_else(|| PathBuf::from("logs")),
            }
        }
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Delete gateway log files whose last write predates the retention
/// window. Runs once before the appender opens today's file; individual
/// unreadable entries are skipped, they only cost disk.
fn prune_stale_logs(log_dir: &Path, retention_days: u64) -> Result<()> {
    let window = Duration::from_secs(retention_days * 24 * 60 * 60);
    let Some(cutoff) = SystemTime::now().checked_sub(window) else {
        return Ok(());
    };

    let mut pruned = 0usize;
    for entry in std::fs::read_dir(log_dir)?.flatten() {
        let path = entry.path();
        let ours = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !ours {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|written| written <= cutoff)
            .unwrap_or(false);
        if stale && std::fs::remove_file(&path).is_ok() {
            pruned += 1;
        }
    }
    if pruned > 0 {
        eprintln!("Pruned {pruned} gateway log file(s) past the {retention_days}-day retention");
    }
    Ok(())
}
