//! Tracing initialization: stdout plus two daily-rotated file sinks.
//!
//! The operational sink honours the CLI log level; the debug sink always
//! captures DEBUG and above. File writers are non-blocking, so the returned
//! guards must stay alive for the lifetime of the process.

use crate::cli::LogLevel;
use crate::defaults::{DEBUG_LOG_FILE_PREFIX, LOG_FILE_PREFIX};
use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory `{dir}`: {source}")]
    CreateDir {
        dir: String,
        source: std::io::Error,
    },
    #[error("cannot build rolling file appender: {0}")]
    Appender(String),
}

type LayerBox = Box<dyn Layer<Registry> + Send + Sync>;

pub fn init(
    level: LogLevel,
    log_dir: &Path,
    debug_log_dir: &Path,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    let (layers, guards) = build_layers(level, log_dir, debug_log_dir)?;
    tracing_subscriber::registry().with(layers).init();
    Ok(guards)
}

fn build_layers(
    level: LogLevel,
    log_dir: &Path,
    debug_log_dir: &Path,
) -> Result<(Vec<LayerBox>, Vec<WorkerGuard>), LoggingError> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(tracing::level_filters::LevelFilter::from(level))
        .boxed();

    let (operational_writer, operational_guard) =
        tracing_appender::non_blocking(daily_appender(log_dir, LOG_FILE_PREFIX)?);
    let operational_layer = tracing_subscriber::fmt::layer()
        .with_writer(operational_writer)
        .with_ansi(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(tracing::level_filters::LevelFilter::from(level))
        .boxed();

    let (debug_writer, debug_guard) =
        tracing_appender::non_blocking(daily_appender(debug_log_dir, DEBUG_LOG_FILE_PREFIX)?);
    let debug_layer = tracing_subscriber::fmt::layer()
        .with_writer(debug_writer)
        .with_ansi(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(tracing::level_filters::LevelFilter::DEBUG)
        .boxed();

    Ok((
        vec![stdout_layer, operational_layer, debug_layer],
        vec![operational_guard, debug_guard],
    ))
}

fn daily_appender(dir: &Path, prefix: &str) -> Result<RollingFileAppender, LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        dir: dir.display().to_string(),
        source,
    })?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| LoggingError::Appender(e.to_string()))
}
