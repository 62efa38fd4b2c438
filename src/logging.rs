use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the logging system with both console and file output.
///
/// `RUST_LOG` wins over `default_filter`. The returned guard flushes the file
/// writer on drop, so keep it alive for the life of the process.
pub fn init_logging(cfg: &LoggingConfig) -> WorkerGuard {
    let _ = fs::create_dir_all(&cfg.dir);

    // Daily-rotated JSON file output
    let file_appender = tracing_appender::rolling::daily(&cfg.dir, &cfg.file_name);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stdout);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.default_filter));

    // try_init so tests and tools that already installed a subscriber keep theirs
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    guard
}

/// Console-only logging for short-lived CLI commands.
pub fn init_console_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
