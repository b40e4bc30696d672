//! Structured logging initialization.
//!
//! The external process supervisor owns stdout and any file rotation;
//! this helper only installs the subscriber shaped by the `app` config.
//! `RUST_LOG` still wins over the configured default level.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{AppConfig, LogFormat};

/// Installs the global tracing subscriber. Call at most once per process.
pub fn init(app: &AppConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(app.log_level.parse()?)
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    match app.log_format {
        LogFormat::Text => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_parse() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let directive: Result<tracing_subscriber::filter::Directive, _> = level.parse();
            assert!(directive.is_ok(), "{level}");
        }
    }
}
