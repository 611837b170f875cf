//! TCP listener and proxy bootstrap.

use crate::config::ProxyConfig;
use crate::core_module::{CoreModuleFactory, CORE_MODULE_NAME};
use crate::error::ProxyError;
use crate::session::ProxyCore;
use crate::transport::framed;
use crate::upstream::{TcpUpstreamConnector, UpstreamConnector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Accept loop wrapper around a [`ProxyCore`].
///
/// At most one client is proxied at a time; additional connections are
/// kicked by the core with a "too many connections" notice.
pub struct ProxyServer {
    core: Arc<ProxyCore>,
}

impl ProxyServer {
    /// Builds a proxy that dials the configured upstream over the framed
    /// dev transport.
    pub async fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let connector = Arc::new(TcpUpstreamConnector::new(&config));
        Self::with_connector(config, connector).await
    }

    /// Builds a proxy with a custom upstream connector (embedding, tests).
    pub async fn with_connector(
        config: ProxyConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self, ProxyError> {
        config.validate().map_err(ProxyError::Config)?;
        let core = ProxyCore::new(config, connector);
        bootstrap(&core).await?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// Binds the local listener and feeds accepted connections to the core.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let port = self.core.config().proxy_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, motd = %self.core.config().motd, "proxy listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "inbound connection");
            let (stream, sink) = framed::split(stream);
            self.core.accept_client(Box::new(stream), sink);
        }
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

/// Installs the core module and performs module auto-import: everything in
/// `modules_dir` is imported, then the configured `modules` list is loaded
/// in order. Individual module failures are logged and skipped so one bad
/// module cannot take the proxy down.
pub(crate) async fn bootstrap(core: &Arc<ProxyCore>) -> Result<(), ProxyError> {
    let proxy = core.context();
    let modules = core.modules();

    modules.register_factory(CORE_MODULE_NAME, Arc::new(CoreModuleFactory));
    modules.import_from_factory(CORE_MODULE_NAME, &proxy, true)?;
    modules.load(CORE_MODULE_NAME, proxy.clone()).await?;

    if let Some(dir) = core.config().resolved_modules_dir() {
        if dir.is_dir() {
            for path in modules.discover(&dir)? {
                match modules.import_from_path(&path, &proxy) {
                    Ok(name) => {
                        info!(module = %name, path = %path.display(), "module auto-imported")
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "module import failed")
                    }
                }
            }
        } else {
            warn!(dir = %dir.display(), "modules_dir does not exist");
        }
    }

    for name in core.config().modules.clone() {
        if let Err(e) = modules.load(&name, proxy.clone()).await {
            error!(module = %name, error = %e, "failed to load configured module");
        }
    }

    Ok(())
}
