//! # Proxy Server
//!
//! The dual-connection proxy core: a local listener accepts one client, an
//! authenticated upstream connection is opened, and decoded packets are
//! pumped between the two through the hook pipeline. The built-in core
//! module layers chat commands, keepalive supervision and command-graph
//! merging on top.
//!
//! The wire codec for the real game protocol is an external collaborator;
//! see [`transport`] for the contract and the in-tree stand-ins.

pub mod auth;
pub mod config;
pub mod core_module;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use auth::SessionCredentials;
pub use config::ProxyConfig;
pub use core_module::{CoreModule, CoreModuleFactory, CORE_MODULE_NAME};
pub use error::{ProxyError, TransportError};
pub use server::ProxyServer;
pub use session::{ProxyCore, SessionPhase};
pub use upstream::{TcpUpstreamConnector, UpstreamConnector};
