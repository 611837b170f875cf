//! # Spyglass - Main Entry Point
//!
//! A man-in-the-middle proxy for a versioned, packet-oriented game
//! protocol. Spyglass accepts one client on a local listener, opens an
//! authenticated connection to the configured upstream, and pumps decoded
//! packets through an ordered hook pipeline that loadable modules extend at
//! runtime.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (spyglass.toml, created if missing)
//! spyglass
//!
//! # Specify a custom configuration
//! spyglass --config production.toml
//!
//! # Override specific settings
//! spyglass --port 25566 --server mc.example.net --log-level debug
//!
//! # JSON logging for production
//! spyglass --json-logs
//! ```
//!
//! ## Signal Handling
//!
//! The proxy shuts down gracefully on SIGINT (Ctrl+C) and SIGTERM; a
//! second signal exits immediately.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point: parses the CLI, loads configuration, sets up logging
/// and runs the application until a shutdown signal arrives.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration first to get the logging settings.
    let config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("failed to set up logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("application error: {e:?}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use config::{AppConfig as SpyglassConfig, LoggingSettings};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.proxy_port, 25565);
        assert_eq!(config.proxy.command_prefix, "/p:");
    }

    #[test]
    fn cli_args_structure() {
        let args = CliArgs {
            config_path: PathBuf::from("test.toml"),
            proxy_port: Some(25566),
            server_address: Some("mc.example.net".to_string()),
            modules_dir: Some(PathBuf::from("modules")),
            log_level: Some("debug".to_string()),
            json_logs: true,
        };

        assert_eq!(args.config_path, PathBuf::from("test.toml"));
        assert_eq!(args.proxy_port, Some(25566));
        assert_eq!(args.server_address.as_deref(), Some("mc.example.net"));
        assert!(args.json_logs);
    }
}
