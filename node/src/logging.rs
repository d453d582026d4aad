//! # Logging
//!
//! `tracing` output for the node goes to stderr, leaving stdout for the SAS
//! and the verification report. `RUST_LOG` takes precedence over the
//! built-in filter, e.g. `RUST_LOG=keytrust_protocol=trace` to see MAC
//! material.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogFormat;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(default_filter: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_current_span(false))
            .try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {}", err))?;

    tracing::debug!(?format, "logging ready");
    Ok(())
}
