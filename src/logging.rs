//! Tracing setup for the command-line tool.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Environment variable holding the log filter, e.g. `apphive_query=debug`.
pub const LOG_ENV: &str = "APPHIVE_LOG";

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
  Stderr,
  /// Daily-rotated files under [`Config::log_dir`]
  File,
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init(target: LogTarget) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  match target {
    LogTarget::Stderr => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
    LogTarget::File => {
      let dir = Config::log_dir()?;
      std::fs::create_dir_all(&dir).map_err(|e| {
        Error::Config(format!("Failed to create log directory {}: {}", dir.display(), e))
      })?;
      let appender = tracing_appender::rolling::daily(&dir, "apphive-query.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
  }
}
