//! Packet transport contract.
//!
//! The proxy core does not speak the game wire protocol; it consumes a
//! transport that yields already-decoded packets and accepts structured
//! writes. A connection is split into a [`PacketStream`] (driven by a
//! reader task) and a shared [`PacketSink`]. Two implementations live in
//! tree: an in-memory channel pair for tests and embedding, and a
//! length-prefixed JSON codec over TCP that stands in for the real game
//! codec during development.

pub mod framed;
pub mod memory;

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;

/// Metadata accompanying every decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    /// Packet type name (e.g. `chat`, `keep_alive`).
    pub name: String,
    /// Protocol state the packet belongs to (`handshake`, `login`, `play`).
    pub state: String,
}

/// Everything a transport can report to the proxy.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded packet.
    Packet { data: Value, meta: PacketMeta },
    /// The transport switched protocol state.
    State(String),
    /// The login exchange completed successfully.
    Login,
    /// The connection ended, optionally with a reason.
    End(Option<String>),
    /// The connection failed.
    Error(String),
}

/// Reader half of a transport connection.
#[async_trait]
pub trait PacketStream: Send {
    /// The next event, or `None` once the transport is exhausted.
    async fn next(&mut self) -> Option<TransportEvent>;
}

/// Writer half of a transport connection.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Encodes and writes one packet.
    async fn write(&self, name: &str, data: Value) -> Result<(), TransportError>;

    /// Closes the connection, notifying the peer of the reason when the
    /// underlying transport can carry one.
    async fn close(&self, reason: Option<String>) -> Result<(), TransportError>;
}
