//! Logging system setup.
//!
//! Built on `tracing-subscriber`. The filter is seeded from the `LOG_LEVEL`
//! environment variable (falling back to the configured level) and can be
//! overridden entirely through `RUST_LOG`; `LOG_DISABLE_COLOR=1` turns off
//! ANSI colors for plain-text output.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system with the given configuration.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let disable_color = std::env::var("LOG_DISABLE_COLOR")
        .map(|v| v == "1")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(!disable_color)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    info!(%level, "logging initialized");
    Ok(())
}

/// Logs the startup banner.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("Spyglass Proxy v{version}");
    info!("  packet hooks / chat commands / hot-reloadable modules");
}
