use chrono::Local;
use std::io;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::config::LoggingConfig;

/// Install the global subscriber. RUST_LOG wins over the configured level.
///
/// With a log directory the output goes to a timestamp-named file in it,
/// otherwise to stderr.
pub fn init_tracing(config: &LoggingConfig) -> io::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
    };

    match &config.directory {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_name = format!("tavern_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
            let file_appender = rolling::never(log_dir, &file_name);

            let subscriber = tracing_subscriber::registry()
                .with(
                    fmt::Layer::new()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter);
            tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

            tracing::debug!(
                target: "tavern::utils::tracing",
                path = %log_dir.join(&file_name).display(),
                "Tracing initialized with file output"
            );
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    fmt::Layer::default()
                        .with_writer(io::stderr)
                        .with_target(true),
                )
                .with(filter);
            tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

            tracing::debug!(
                target: "tavern::utils::tracing",
                "Tracing initialized with stderr output"
            );
        }
    }

    Ok(())
}

