//!
//! src/logging.rs  Andrew Belles  Oct 16th, 2026
//!
//! Initializes the logger. Json lines by default, a pretty layout for
//! interactive runs. RUST_LOG overrides the configured directives.
//!
//!

use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tracing_error::ErrorLayer;
use tracing_appender::non_blocking;

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::LinkerError;

/// Keeps the background writer alive, logs are flushed when dropped
pub struct LoggingGuard(tracing_appender::non_blocking::WorkerGuard);

pub fn init_logging(cfg: &LoggingConfig) -> Result<LoggingGuard, LinkerError> {
    let (writer, guard) = non_blocking(std::io::stdout());
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()));

    let time = fmt::time::UtcTime::rfc_3339();
    let json = (cfg.format == LogFormat::Json).then(|| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_timer(time.clone())
            .with_ansi(false)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
    });
    let pretty = (cfg.format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(writer)
            .with_timer(time)
            .with_ansi(cfg.with_ansi)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .pretty()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|e| LinkerError::Config(format!("logger already set: {e}")))?;

    Ok( LoggingGuard(guard) )
}
