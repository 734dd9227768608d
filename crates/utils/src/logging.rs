//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Target used by events that should land in the side log file.
pub const SIDE_LOG_TARGET: &str = "decisions";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// stderr formatting layer shared by every binary in the workspace
pub fn get_fmt_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// initiate the global tracing subscriber
pub fn init() {
    let fmt_layer = get_fmt_layer().with_filter(env_filter());
    registry().with(fmt_layer).init();
}

/// Initiate the global tracing subscriber and route events whose target is
/// [`SIDE_LOG_TARGET`] to a daily rotated file.
///
/// The returned guard must be held until shutdown, dropping it flushes the
/// file writer.
pub fn init_with_side_log(path: &Path) -> std::io::Result<WorkerGuard> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| std::io::Error::other(format!("invalid log file path: {}", path.display())))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(3)
        .build(dir)
        .map_err(std::io::Error::other)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = get_fmt_layer().with_filter(env_filter().and(filter::filter_fn(
        |metadata| metadata.target() != SIDE_LOG_TARGET,
    )));

    let side_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == SIDE_LOG_TARGET
        }));

    registry().with(fmt_layer).with(side_layer).init();
    Ok(file_guard)
}
