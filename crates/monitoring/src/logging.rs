use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use tradegate_core::config::LoggingConfig;
use tradegate_core::{Result, TradeGateError};

/// `RUST_LOG` wins over the configured level.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber: console output plus an optional
/// daily-rolling file. Keep the returned guard alive for as long as file
/// output should be flushed.
pub fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();

    let console_layer = fmt::layer().with_target(true).with_thread_ids(true);
    if config.json {
        layers.push(console_layer.json().boxed());
    } else {
        layers.push(console_layer.boxed());
    }

    let mut guard = None;
    if let Some(log_file) = &config.file {
        let log_path = Path::new(log_file);
        let directory = log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)
            .map_err(|e| TradeGateError::Internal(format!("Failed to create log directory: {}", e)))?;

        let file_appender = rolling::daily(directory, log_path.file_name().unwrap_or_else(|| OsStr::new("tradegate.log")));
        let (writer, file_guard) = non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        if config.json {
            layers.push(file_layer.json().boxed());
        } else {
            layers.push(file_layer.boxed());
        }
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(build_filter(&config.level))
        .with(layers)
        .try_init()
        .map_err(|e| TradeGateError::Internal(format!("Failed to install log subscriber: {}", e)))?;

    info!(level = %config.level, json = config.json, file = ?config.file, "Logging initialized");
    Ok(guard)
}
