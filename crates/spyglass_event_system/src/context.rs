//! The seam between the proxy core and everything that plugs into it.
//!
//! Modules and command handlers never see the proxy's concrete type; they
//! get an `Arc<dyn ProxyContext>` giving them the hook pipeline, the command
//! registry, packet injection, timers, and module management. The proxy
//! server crate provides the implementation.

use crate::command::registry::CommandRegistry;
use crate::error::{ContextError, ModuleError};
use crate::hooks::HookPipeline;
use crate::module::{BoundCallback, TimerHandle};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Capabilities the proxy exposes to modules and command handlers.
#[async_trait]
pub trait ProxyContext: Send + Sync {
    /// The per-proxy hook table.
    fn hooks(&self) -> &HookPipeline;

    /// The per-proxy command registry.
    fn commands(&self) -> &CommandRegistry;

    /// The configured `module_config` entry for a module, if any.
    fn module_config(&self, module: &str) -> Option<Value>;

    /// Writes a synthetic packet to the client socket, bypassing hooks.
    async fn inject_client(&self, kind: &str, data: Value) -> Result<(), ContextError>;

    /// Writes a synthetic packet to the upstream socket, bypassing hooks.
    async fn inject_server(&self, kind: &str, data: Value) -> Result<(), ContextError>;

    /// Schedules `callback` to fire repeatedly. Firings are delivered on the
    /// proxy's single execution context, serialized with packet hooks.
    fn set_interval(&self, label: &str, period: Duration, callback: BoundCallback) -> TimerHandle;

    /// Schedules `callback` to fire once after `delay`.
    fn set_timeout(&self, label: &str, delay: Duration, callback: BoundCallback) -> TimerHandle;

    /// Drops the proxied client, kicking it with `reason` when one is given.
    async fn disconnect_client(&self, reason: Option<String>) -> Result<(), ContextError>;

    /// Tears down the upstream connection.
    async fn disconnect_server(&self, reason: Option<String>) -> Result<(), ContextError>;

    async fn load_module(&self, name: &str) -> Result<(), ModuleError>;

    async fn unload_module(&self, name: &str) -> Result<(), ModuleError>;

    async fn reload_module(&self, name: &str) -> Result<(), ModuleError>;

    /// Imports a module from a dynamic library path and returns its
    /// self-declared name.
    async fn import_module(&self, path: &str) -> Result<String, ModuleError>;
}
