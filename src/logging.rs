//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies. Output
//! goes to stderr (text or JSON) and, optionally, is appended to a log file.

use crate::config::ApplicationConfig;
use crate::error::BenchResult;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build the filter: `RUST_LOG` if present, else `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Calling it twice keeps the first one.
pub fn init_tracing(config: &ApplicationConfig) -> BenchResult<()> {
    let stderr_layer = if config.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
