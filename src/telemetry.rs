//! Logging initialization driven by the logging configuration.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    if logging.format == "json" {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false));
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        tracing::subscriber::set_global_default(subscriber)?;
    }

    tracing::info!("Logging initialized ({} format)", logging.format);
    Ok(())
}
