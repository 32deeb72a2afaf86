//! Logging setup for the CLI
//!
//! Logs go to stderr so command output on stdout stays machine readable.

use std::io;

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global subscriber; `RUST_LOG` takes precedence over `level`
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let layer = fmt::layer().with_writer(io::stderr).with_target(false);

    match format {
        LogFormat::Json => tracing_subscriber::registry().with(filter).with(layer.json()).try_init()?,
        LogFormat::Text => tracing_subscriber::registry().with(filter).with(layer).try_init()?,
    }
    Ok(())
}
