//! Prefix-matched dispatch of chat-originated commands.
//!
//! Chat messages starting with the configured prefix (default `/p:`) are
//! commands for the proxy itself. The registry resolves the first token to a
//! registered handler and runs it; the chat hook in the core module consults
//! the boolean result to cancel forwarding of handled messages, so proxy
//! commands never reach the remote server.

use crate::command::graph::CommandGraph;
use crate::context::ProxyContext;
use crate::error::CommandError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What a module registers: name, description, optional autocomplete
/// subtree and the handler.
pub struct CommandDescriptor {
    /// Stored lowercased; lookup is case-insensitive on the first token.
    pub name: String,
    pub description: String,
    /// Autocomplete subtree whose root is a literal node. Merged into the
    /// server-declared command graph when the prefix is slash-based.
    pub autocomplete: Option<CommandGraph>,
    pub handler: Arc<dyn CommandHandler>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> Result<(), CommandError>;
}

/// Handle to a registered command, used for unregistration.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Invocation context handed to command handlers. `args[0]` is the command
/// name with the prefix stripped and lowercased.
#[derive(Clone)]
pub struct CommandContext {
    pub args: Vec<String>,
    proxy: Arc<dyn ProxyContext>,
}

impl CommandContext {
    pub fn new(args: Vec<String>, proxy: Arc<dyn ProxyContext>) -> Self {
        Self { args, proxy }
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyContext> {
        &self.proxy
    }

    /// Sends a plain-text chat message to the proxied client.
    pub async fn reply(&self, message: &str) -> Result<(), CommandError> {
        self.reply_component(json!({ "text": message })).await
    }

    /// Sends a chat component (JSON text) to the proxied client.
    pub async fn reply_component(&self, component: Value) -> Result<(), CommandError> {
        let message = serde_json::to_string(&component)?;
        self.proxy
            .inject_client("chat", json!({ "message": message, "position": 0 }))
            .await?;
        Ok(())
    }

    /// Sends a chat message to the upstream server as if the client typed it.
    pub async fn send_server(&self, message: &str) -> Result<(), CommandError> {
        self.proxy
            .inject_server("chat", json!({ "message": message }))
            .await?;
        Ok(())
    }
}

struct RegisteredCommand {
    #[allow(dead_code)]
    description: String,
    autocomplete: Option<CommandGraph>,
    handler: Arc<dyn CommandHandler>,
}

/// The per-proxy command table.
pub struct CommandRegistry {
    prefix: String,
    commands: DashMap<String, RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            commands: DashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a command under its lowercased name.
    ///
    /// When the prefix is slash-based, the autocomplete root is renamed to
    /// carry the bare prefix (`/p:` + `foo` → `p:foo`) so the merged graph
    /// advertises the name the client actually has to type.
    pub fn register(&self, mut descriptor: CommandDescriptor) -> Result<Command, CommandError> {
        let name = descriptor.name.to_lowercase();

        if let Some(bare) = self.prefix.strip_prefix('/') {
            if let Some(graph) = descriptor.autocomplete.as_mut() {
                let root = graph.root();
                if let Some(node) = graph.node_mut(root) {
                    if let Some(node_name) = node.name.as_mut() {
                        if !node_name.starts_with(bare) {
                            *node_name = format!("{bare}{node_name}");
                        }
                    }
                }
            }
        }

        match self.commands.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CommandError::Duplicate(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RegisteredCommand {
                    description: descriptor.description,
                    autocomplete: descriptor.autocomplete,
                    handler: descriptor.handler,
                });
                debug!(command = %name, "command registered");
                Ok(Command { name })
            }
        }
    }

    pub fn unregister(&self, command: &Command) -> Result<(), CommandError> {
        self.commands
            .remove(command.name())
            .map(|_| ())
            .ok_or_else(|| CommandError::Unknown(command.name().to_string()))
    }

    /// Dispatches a chat message.
    ///
    /// Returns `Ok(false)` when the message does not carry the prefix (it is
    /// ordinary chat and should be forwarded). Returns `Ok(true)` whenever
    /// the message was consumed as a command attempt, including unknown
    /// commands and handler failures; both are reported back to the
    /// invoking user, not to the server.
    pub async fn execute(
        &self,
        message: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<bool, CommandError> {
        if !message.starts_with(&self.prefix) {
            return Ok(false);
        }

        let mut args: Vec<String> = message.split(' ').map(str::to_string).collect();
        let stripped = match args[0].strip_prefix(&self.prefix) {
            Some(rest) => rest.to_lowercase(),
            None => return Ok(false),
        };
        args[0] = stripped;
        let name = args[0].clone();

        let handler = self.commands.get(&name).map(|c| c.handler.clone());
        let ctx = CommandContext::new(args, proxy);

        match handler {
            None => {
                warn!(command = %name, "command not found");
                if let Err(e) = ctx
                    .reply_component(json!({ "translate": "command.unknown.command", "color": "red" }))
                    .await
                {
                    debug!(error = %e, "could not deliver command-not-found reply");
                }
                Ok(true)
            }
            Some(handler) => {
                if let Err(e) = handler.handle(ctx.clone()).await {
                    error!(command = %name, error = %e, "command handler failed");
                    if let Err(reply_err) = ctx
                        .reply_component(json!({ "text": format!("Command failed: {e}"), "color": "red" }))
                        .await
                    {
                        debug!(error = %reply_err, "could not deliver command failure reply");
                    }
                }
                Ok(true)
            }
        }
    }

    /// Autocomplete subtrees of all registered commands, keyed by command
    /// name. Empty unless the prefix is slash-based, since the client's
    /// autocomplete only fires on slash-prefixed input.
    pub fn autocomplete_roots(&self) -> Vec<(String, CommandGraph)> {
        if !self.prefix.starts_with('/') {
            return Vec::new();
        }
        self.commands
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .autocomplete
                    .clone()
                    .map(|graph| (entry.key().clone(), graph))
            })
            .collect()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|e| e.key().clone()).collect()
    }
}
