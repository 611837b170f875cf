//! Error types shared across the proxy core and its modules.

use thiserror::Error;

/// Errors raised by the hook pipeline.
#[derive(Debug, Error)]
pub enum EventError {
    /// A hook handler failed. Aborts the traversal; the packet that was
    /// being processed is not forwarded.
    #[error("hook handler failed: {0}")]
    Handler(String),

    /// The hook was not a member of any list (double unregister).
    #[error("hook is not registered")]
    UnknownHook,

    /// Event payload could not be read or built.
    #[error("event payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors raised by the command registry and the command graph.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A command with the same (lowercased) name is already registered.
    #[error("command already registered: {0}")]
    Duplicate(String),

    /// Unregistration of a command the registry does not know.
    #[error("unknown command: {0}")]
    Unknown(String),

    /// A graph node is structurally invalid for serialization (e.g. a
    /// literal without a name) or a wire entry carries an unusable shape.
    #[error("malformed command graph: {0}")]
    MalformedGraph(String),

    /// A child or redirect index in the wire form points outside the node
    /// array.
    #[error("command graph index {index} out of range ({len} nodes)")]
    IndexOutOfRange { index: usize, len: usize },

    /// A command handler failed; reported back to the invoking user.
    #[error("command handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("command payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors raised by [`crate::ProxyContext`] operations.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no client connection attached")]
    NoClientConnection,

    #[error("no upstream connection attached")]
    NoServerConnection,

    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Errors raised by module implementations and the module registry.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module already registered: {0}")]
    DuplicateName(String),

    #[error("unknown module: {0}")]
    UnknownName(String),

    /// Load while loaded, unload while unloaded, reload without an origin,
    /// or unloading the core module outside of a reload.
    #[error("invalid module state: {0}")]
    InvalidState(String),

    /// Re-import or cache invalidation failed during a reload. The old
    /// module remains loaded and operational.
    #[error("module reload failed: {0}")]
    ReloadFailure(String),

    /// The module library could not be opened or its entry points resolved.
    #[error("module load failed: {0}")]
    LoadFailure(String),

    #[error("module {module} has no callback named {key}")]
    UnknownCallback { module: String, key: String },

    #[error("module execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Context(#[from] ContextError),
}
