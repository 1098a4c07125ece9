use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "lpr-edge.log";

/// Install the global subscriber.
///
/// Returns the file writer's guard when file logging is enabled; it has to
/// stay alive for the whole process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    });

    let mut guard = None;
    let file_layer = config.directory.as_deref().and_then(|dir| {
        if let Err(e) = fs::create_dir_all(dir) {
            eprintln!("lpr-edge: cannot create log directory {}: {}", dir.display(), e);
            return None;
        }
        cleanup_old_logs(dir, config.retention_days);
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .boxed(),
        )
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("lpr-edge: logging already initialised: {}", e);
    }

    guard
}

/// Remove rotated log files whose last write is older than `retention_days`.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> usize {
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let now = SystemTime::now();
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log || !path.is_file() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if matches!(age, Some(age) if age > retention) && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}
