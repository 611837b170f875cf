//! Packet event model for the hook pipeline.
//!
//! Every decoded packet (and every local lifecycle notification) travels the
//! pipeline as an [`Event`]: a mutable payload tagged with the packet type
//! and the [`Direction`] it is flowing in. Handlers mutate the payload in
//! place and answer with an [`EventAction`] that controls both the rest of
//! the traversal and whether the packet is forwarded to the opposite peer.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Which hook table an event is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Packets received from the proxied client, headed for the upstream
    /// server.
    ClientToServer,
    /// Packets received from the upstream server, headed for the client.
    ServerToClient,
    /// Proxy-internal lifecycle notifications (`clientConnected`,
    /// `serverDisconnected`, ...). Never forwarded anywhere.
    Local,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "c2s"),
            Direction::ServerToClient => write!(f, "s2c"),
            Direction::Local => write!(f, "local"),
        }
    }
}

/// A hook handler's verdict on the event it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Keep traversing; later hooks still run and the packet is forwarded
    /// unless one of them cancels it.
    Continue,
    /// Stop the traversal but still forward the packet.
    CancelHooks,
    /// Stop the traversal and suppress forwarding of this packet.
    Cancel,
}

/// A single packet (or local notification) moving through the pipeline.
#[derive(Debug)]
pub struct Event {
    kind: CompactString,
    direction: Direction,
    /// Structured packet payload. Mutations made by hooks are what gets
    /// forwarded to the opposite peer.
    pub data: Value,
}

impl Event {
    pub fn new(direction: Direction, kind: &str, data: Value) -> Self {
        Self {
            kind: CompactString::new(kind),
            direction,
            data,
        }
    }

    /// The packet type name (e.g. `chat`, `keep_alive`) or local event name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Consumes the event, yielding the (possibly mutated) payload.
    pub fn into_data(self) -> Value {
        self.data
    }
}

/// Names of the proxy lifecycle notifications dispatched on
/// [`Direction::Local`].
pub mod local {
    pub const CLIENT_CONNECTED: &str = "clientConnected";
    pub const CLIENT_DISCONNECTED: &str = "clientDisconnected";
    pub const SERVER_CONNECTED: &str = "serverConnected";
    pub const SERVER_DISCONNECTED: &str = "serverDisconnected";
    /// Fired after `clientConnected` hooks complete, immediately before the
    /// upstream connection is attempted.
    pub const BEFORE_SERVER_CONNECT: &str = "beforeServerConnect";
}
