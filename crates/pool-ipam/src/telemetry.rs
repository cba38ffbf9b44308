//! Tracing initialization for the controller and node agent runtimes

use crate::config::LoggingConfig;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Only the first call
/// installs anything; later calls are no-ops returning `Ok(false)`.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    if TRACING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_thread_ids(true),
            )
            .try_init()
    };

    result.map_err(|e| Error::Config(format!("failed to initialize tracing: {}", e)))?;
    Ok(true)
}
