//! Logging setup.

use std::path::Path;

use crate::runtime::constants::filenames;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber: compact stderr output plus a daily
/// rolling file `<logs_dir>/boxforge.log.YYYY-MM-DD`.
///
/// `RUST_LOG` overrides `default_level`. Keep the returned guard alive
/// until exit; dropping it flushes the file writer.
pub fn init_logging(logs_dir: &Path, default_level: &str) -> BoxforgeResult<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        BoxforgeError::Storage(format!(
            "Failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    register_to_tracing(non_blocking, env_filter);

    Ok(guard)
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let guard = init_logging(&logs, "info").unwrap();
        tracing::info!("hello from the logging test");
        drop(guard);

        assert!(logs.is_dir());
        let files: Vec<_> = std::fs::read_dir(&logs).unwrap().flatten().collect();
        assert!(
            files
                .iter()
                .any(|f| f.file_name().to_string_lossy().starts_with("boxforge.log"))
        );
    }
}
