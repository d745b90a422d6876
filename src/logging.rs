//! Logging configuration for digestd.
//!
//! - Debug builds: console + file output (debug level)
//! - Release builds: file output only (info level)
//!
//! `RUST_LOG` overrides the default filter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_DIR_NAME: &str = ".digestd";
const LOG_FILE_PREFIX: &str = "digestd.log";
const LOG_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub fn init() {
    let is_debug = cfg!(debug_assertions);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if is_debug { "debug" } else { "info" };
        EnvFilter::new(format!("digestd={level},warn"))
    });

    let file_layer = log_dir().and_then(|dir| {
        fs::create_dir_all(&dir).ok()?;
        prune_logs(&dir, LOG_MAX_AGE, SystemTime::now());
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        Some(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(appender),
        )
    });

    let console_layer = (is_debug || file_layer.is_none())
        .then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(LOG_DIR_NAME).join("logs"))
}

/// Deletes files in `dir` last modified more than `max_age` before `now`.
/// Returns how many were removed.
fn prune_logs(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let expired = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);

        if expired && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
