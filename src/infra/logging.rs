//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level. With a log directory set, output
//! goes to a daily rolling file through a non-blocking writer; the returned
//! guard must live until the process exits or buffered lines are lost. If the
//! directory cannot be created, output falls back to stdout with a warning.

use crate::infra::config::LoggingSettings;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix for rolling log files
const LOG_FILE_PREFIX: &str = "cycle-counter.log";

/// Install the global subscriber. Returns the writer guard when logging to a file.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let file_writer = match open_log_dir(&settings.dir) {
        Ok(writer) => writer,
        Err(e) => {
            install_stdout(registry, settings.json)?;
            warn!(log_dir = %settings.dir, error = %format!("{e:#}"), "log_file_unavailable_using_stdout");
            return Ok(None);
        }
    };
    let Some((writer, guard)) = file_writer else {
        install_stdout(registry, settings.json)?;
        return Ok(None);
    };

    let result = if settings.json {
        registry.with(fmt::layer().json().with_timer(UtcTime::rfc_3339()).with_writer(writer)).try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_timer(UtcTime::rfc_3339())
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init()
    };
    result.context("failed to install tracing subscriber")?;
    Ok(Some(guard))
}

/// Daily rolling writer for `dir`; None when file logging is off
fn open_log_dir(dir: &str) -> Result<Option<(NonBlocking, WorkerGuard)>> {
    if dir.trim().is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create log directory {dir}"))?;
    if !Path::new(dir).is_dir() {
        anyhow::bail!("log directory {dir} is not a directory");
    }
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(Some(tracing_appender::non_blocking(appender)))
}

fn install_stdout<S>(registry: S, json: bool) -> Result<()>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync + 'static,
{
    let result = if json {
        registry.with(fmt::layer().json().with_timer(UtcTime::rfc_3339())).try_init()
    } else {
        registry.with(fmt::layer().with_timer(UtcTime::rfc_3339()).with_target(false)).try_init()
    };
    result.context("failed to install tracing subscriber")
}
