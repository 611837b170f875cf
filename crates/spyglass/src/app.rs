//! Application lifecycle: startup, monitoring and graceful shutdown.

use crate::{cli::CliArgs, config::AppConfig, logging::display_banner, signals};
use proxy_server::{ProxyServer, CORE_MODULE_NAME};
use tracing::{error, info, warn};

/// Orchestrates the proxy server's lifecycle.
pub struct Application {
    config: AppConfig,
    server: ProxyServer,
}

impl Application {
    /// Loads configuration, applies CLI overrides, validates the result and
    /// builds the proxy server (which installs the core module and performs
    /// module auto-import).
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("loading configuration from {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(port) = args.proxy_port {
            config.proxy.proxy_port = port;
        }
        if let Some(server) = args.server_address {
            config.proxy.server_address = server;
        }
        if let Some(dir) = args.modules_dir {
            config.proxy.modules_dir = Some(dir.to_string_lossy().to_string());
        }
        if let Some(level) = args.log_level {
            config.logging.level = level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("configuration validation failed: {e}").into());
        }

        display_banner();
        info!(
            "  listener :{} -> upstream {}:{}",
            config.proxy.proxy_port, config.proxy.server_address, config.proxy.server_port
        );
        info!(
            "  command prefix {:?}, {} configured module(s)",
            config.proxy.command_prefix,
            config.proxy.modules.len()
        );

        let server = ProxyServer::new(config.proxy.clone()).await?;
        Ok(Self { config, server })
    }

    /// Runs the proxy until a shutdown signal arrives, then tears down
    /// modules and the active session.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let core = self.server.core().clone();

        let server_handle = {
            let server = self.server;
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("listener error: {e}");
                    std::process::exit(1);
                }
            })
        };

        // Periodic health line, mirroring events through the pipeline.
        let monitoring_handle = {
            let core = core.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
                interval.tick().await; // immediate first tick
                let mut last_executions = 0u64;
                loop {
                    interval.tick().await;
                    let stats = core.hook_pipeline().stats();
                    let executions = stats.executions();
                    info!(
                        "health: {} packets/min through {} registered hooks, {} cancelled, {} handler failures",
                        executions - last_executions,
                        stats.registered(),
                        stats.cancelled(),
                        stats.handler_failures(),
                    );
                    last_executions = executions;
                }
            })
        };

        info!(
            "spyglass is running on port {} - press Ctrl+C to shut down",
            self.config.proxy.proxy_port
        );

        signals::wait_for_shutdown_signal().await?;
        info!("shutdown signal received, beginning graceful shutdown");
        signals::arm_forced_exit();

        monitoring_handle.abort();

        // Unload modules first so they release hooks and commands cleanly;
        // the core module stays (it only unloads during reloads).
        let proxy = core.context();
        for name in core.modules().names() {
            if name == CORE_MODULE_NAME {
                continue;
            }
            if !core.modules().is_loaded(&name) {
                continue;
            }
            if let Err(e) = core.modules().unload(&name, proxy.clone()).await {
                warn!(module = %name, error = %e, "module unload failed during shutdown");
            }
        }

        // Drop the active session and stop the event loop.
        core.shutdown();
        server_handle.abort();

        let stats = core.hook_pipeline().stats();
        info!(
            "final statistics: {} packets processed, {} cancelled, {} handler failures",
            stats.executions(),
            stats.cancelled(),
            stats.handler_failures(),
        );
        info!("shutdown complete");
        Ok(())
    }
}
