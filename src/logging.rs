//! Tracing setup for the `course-engine` binary. The library itself only
//! emits events; installing a subscriber is left to whoever embeds it.

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogRotation};

/// Keeps the non-blocking file writer flushing; drop it last.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Installs stdout logging plus, when `config.file_dir` is set, a rolling
/// file without ANSI colours. A log directory that cannot be created
/// degrades to stdout only.
pub fn init_tracing(config: &LogConfig) -> Result<Option<FileLogGuard>, TryInitError> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match config.file_dir.as_deref() {
        Some(dir) => match file_writer(dir, &config.file_prefix, config.rotation) {
            Ok((writer, guard)) => {
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(FileLogGuard { _guard: guard }))
            }
            Err(err) => {
                eprintln!("file logging disabled, cannot create {}: {err}", dir.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

fn file_writer(
    dir: &Path,
    prefix: &str,
    rotation: LogRotation,
) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(rotation.into(), dir, prefix);
    Ok(tracing_appender::non_blocking(appender))
}
