//! Upstream connection establishment.

use crate::auth::SessionCredentials;
use crate::config::ProxyConfig;
use crate::error::TransportError;
use crate::transport::{framed, PacketSink, PacketStream};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::info;

/// Opens the authenticated server-facing transport for a session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(Box<dyn PacketStream>, Arc<dyn PacketSink>), TransportError>;
}

/// Dials the configured upstream over the framed dev transport and opens
/// the login exchange with the configured session material. The full
/// authentication handshake belongs to the wire codec, which is an external
/// collaborator; this connector only presents the material.
pub struct TcpUpstreamConnector {
    address: String,
    port: u16,
}

impl TcpUpstreamConnector {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            address: config.server_address.clone(),
            port: config.server_port,
        }
    }
}

#[async_trait]
impl UpstreamConnector for TcpUpstreamConnector {
    async fn connect(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(Box<dyn PacketStream>, Arc<dyn PacketSink>), TransportError> {
        let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
        info!(address = %self.address, port = self.port, "upstream connected");

        let (stream, sink) = framed::split(stream);
        sink.write(
            "login_start",
            json!({
                "username": credentials.username,
                "version": credentials.version,
            }),
        )
        .await?;

        let stream: Box<dyn PacketStream> = Box::new(stream);
        let sink: Arc<dyn PacketSink> = sink;
        Ok((stream, sink))
    }
}
