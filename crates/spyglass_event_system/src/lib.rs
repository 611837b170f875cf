//! # Spyglass Event System
//!
//! Core interfaces shared between the proxy and its loadable modules:
//!
//! - **Hook pipeline**: ordered, priority-sorted interception of decoded
//!   packets per `(direction, packet type)`, with precise cancellation
//!   semantics ([`hooks`]).
//! - **Command graph**: the recursive, redirect-capable autocomplete tree
//!   that round-trips through the `declare_commands` wire form
//!   ([`command::graph`]).
//! - **Command registry**: prefix-matched dispatch of chat-originated
//!   commands ([`command::registry`]).
//! - **Module interface**: the trait loadable modules implement, their
//!   preserved-state bag, and the version-chain-aware callback binding used
//!   to keep long-lived timers valid across hot reloads ([`module`]).
//!
//! Modules depend on this crate only; the proxy implements the
//! [`ProxyContext`] seam that gives them access to injection, timers and
//! module management.

pub mod command;
pub mod context;
pub mod error;
pub mod events;
pub mod hooks;
pub mod module;

pub use command::graph::{
    CommandGraph, CommandNode, DeclareCommands, NodeId, NodeKind, SerializedCommandNode,
    SuggestionProvider,
};
pub use command::registry::{
    Command, CommandContext, CommandDescriptor, CommandHandler, CommandRegistry,
};
pub use context::ProxyContext;
pub use error::{CommandError, ContextError, EventError, ModuleError};
pub use events::{local, Direction, Event, EventAction};
pub use hooks::{
    hook_fn, sync_hook, Hook, HookPipeline, PacketHook, PipelineStats, DEFAULT_HOOK_PRIORITY,
};
pub use module::{
    BoundCallback, CallbackBinder, CallbackTarget, Module, ModuleContext, ModuleOwnership,
    ModuleState, TimerHandle,
};

/// ABI version modules are compiled against. The module loader refuses
/// libraries whose reported version is incompatible (major.minor match).
pub const ABI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// NUL-terminated ABI version for the C entry point exported by
/// [`declare_module!`].
#[doc(hidden)]
pub const ABI_VERSION_C: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
