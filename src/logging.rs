//! Tracing setup: stderr for the operator, a daily file for later.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_BASENAME: &str = "stream-recorder.log";
const LOG_DIR_ENV: &str = "STREAM_RECORDER_LOG_PATH";
const LOG_RETENTION_DAYS: i64 = 7;

/// Where log files go. `STREAM_RECORDER_LOG_PATH` wins over the per-user
/// state directory.
pub fn get_log_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    let dirs = ProjectDirs::from("dev", "stream-recorder", "recorder")
        .context("No home directory to put logs under")?;
    let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(base.join("logs"))
}

/// Install stderr and rolling-file logging. Keep the guard alive until exit
/// or buffered file output is lost.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    let today = Local::now().date_naive();
    let pruned = prune_rotated_logs(&log_dir, today, LOG_RETENTION_DAYS);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if pruned > 0 {
        info!("Removed {} rotated log file(s) from {:?}", pruned, log_dir);
    }
    Ok(guard)
}

/// The day a rotated file covers, from its `stream-recorder.log.YYYY-MM-DD` name
fn rotation_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_BASENAME)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Delete rotated files more than `keep_days` days older than `today`.
/// Returns how many were removed.
fn prune_rotated_logs(log_dir: &Path, today: NaiveDate, keep_days: i64) -> usize {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };

    entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let Some(day) = name.to_str().and_then(rotation_date) else {
                return false;
            };
            (today - day).num_days() > keep_days
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}
