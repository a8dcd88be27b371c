//! Logging setup. Everything goes to stderr; stdout carries the host protocol.

use crate::config::{LogFormat, LogSettings};
use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global tracing subscriber. `RUST_LOG` overrides `settings.filter`.
pub fn init(settings: &LogSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .map_err(|e| anyhow!("invalid log filter '{}': {}", settings.filter, e))?;

    let fmt_layer = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
