//! Tracing setup for the binary: daily log files, plus stderr when verbose.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::db::Database;

const LOG_FILE_PREFIX: &str = "plansync.log";

/// Directory holding the rolling log files, next to the database.
pub fn log_dir() -> Result<PathBuf> {
  let db_path = Database::default_path()?;
  db_path
    .parent()
    .map(|dir| dir.join("logs"))
    .ok_or_else(|| eyre!("Could not determine log directory"))
}

/// Install the global subscriber.
///
/// Buffered lines are flushed when the returned guard is dropped, so hold it
/// until the process exits.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(env_filter(verbose))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

/// `RUST_LOG` if set, otherwise info (debug when verbose) for this crate only.
fn env_filter(verbose: bool) -> EnvFilter {
  let default = if verbose { "plansync=debug" } else { "plansync=info" };
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
