//! Log setup for the binary.
//!
//! Everything goes to a daily rolling file in the data directory. `--verbose`
//! adds stderr. The filter is read from `SHOWSYNC_LOG` (default `info`).

use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_ENV: &str = "SHOWSYNC_LOG";
const LOG_FILE_PREFIX: &str = "showsync.log";

/// Keeps the background log writer alive. Drop it last.
pub struct LogGuard {
  _guard: Option<WorkerGuard>,
}

pub fn init(log_dir: &Path, verbose: bool) -> LogGuard {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .with_env_var(LOG_ENV)
    .from_env_lossy();

  let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
  let mut guard = None;
  let mut setup_error = None;

  match std::fs::create_dir_all(log_dir) {
    Ok(()) => {
      let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
      let (writer, worker) = tracing_appender::non_blocking(appender);
      layers.push(
        tracing_subscriber::fmt::layer()
          .with_writer(writer)
          .with_ansi(false)
          .boxed(),
      );
      guard = Some(worker);
    }
    Err(e) => {
      setup_error = Some(format!("log dir init failed for {}: {}", log_dir.display(), e));
    }
  }

  if verbose || guard.is_none() {
    layers.push(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .boxed(),
    );
  }

  layers.push(filter.boxed());
  Registry::default().with(layers).init();

  if let Some(error) = setup_error {
    tracing::warn!("{}", error);
  }

  LogGuard { _guard: guard }
}
