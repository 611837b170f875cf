//! Proxy-side error types.

use spyglass_event_system::{CommandError, EventError, ModuleError};
use thiserror::Error;

/// Unified error type for proxy server operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Errors surfaced by packet transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}
