//! Sample module: logs chat crossing the proxy in either direction and
//! answers a `chatstats` command with running counters.
//!
//! Doubles as a reference for the module interface: the counters and the
//! summary timer are preserve keys, so a hot reload keeps both the totals
//! and the in-flight timer, with the timer callback dispatching into the
//! replacement instance.

use async_trait::async_trait;
use serde_json::Value;
use spyglass_event_system::{
    declare_module, CommandContext, CommandDescriptor, CommandError, CommandGraph, CommandHandler,
    Direction, Event, EventAction, EventError, Module, ModuleContext, ModuleError, ModuleState,
    PacketHook, TimerHandle,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MODULE_NAME: &str = "chat_logger";

const KEY_CLIENT_CHAT: &str = "client_chat_count";
const KEY_SERVER_CHAT: &str = "server_chat_count";
const KEY_SUMMARY_TIMER: &str = "summary_timer";
const CB_SUMMARY: &str = "summary_tick";

const SUMMARY_INTERVAL: Duration = Duration::from_secs(300);

pub struct ChatLoggerModule {
    state: Arc<ModuleState>,
}

impl Default for ChatLoggerModule {
    fn default() -> Self {
        let state = Arc::new(ModuleState::new());
        state.set(KEY_CLIENT_CHAT, AtomicU64::new(0));
        state.set(KEY_SERVER_CHAT, AtomicU64::new(0));
        Self { state }
    }
}

impl ChatLoggerModule {
    fn counter(&self, key: &str) -> Arc<AtomicU64> {
        self.state
            .get::<AtomicU64>(key)
            .expect("chat counter missing")
    }
}

struct ChatTap {
    counter: Arc<AtomicU64>,
    label: &'static str,
    verbose: bool,
}

#[async_trait]
impl PacketHook for ChatTap {
    async fn handle(&self, event: &mut Event) -> Result<EventAction, EventError> {
        self.counter.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = event.data.get("message").and_then(Value::as_str) {
            if self.verbose {
                info!(side = self.label, %message, "chat");
            } else {
                debug!(side = self.label, %message, "chat");
            }
        }
        Ok(EventAction::Continue)
    }
}

struct StatsCommand {
    client: Arc<AtomicU64>,
    server: Arc<AtomicU64>,
}

#[async_trait]
impl CommandHandler for StatsCommand {
    async fn handle(&self, ctx: CommandContext) -> Result<(), CommandError> {
        ctx.reply(&format!(
            "Chat seen: {} from the client, {} from the server",
            self.client.load(Ordering::Relaxed),
            self.server.load(Ordering::Relaxed),
        ))
        .await
    }
}

#[async_trait]
impl Module for ChatLoggerModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn state_preserve_keys(&self) -> &'static [&'static str] {
        &[KEY_CLIENT_CHAT, KEY_SERVER_CHAT, KEY_SUMMARY_TIMER]
    }

    async fn on_load(&self, ctx: ModuleContext, reloading: bool) -> Result<(), ModuleError> {
        let verbose = ctx
            .config()
            .and_then(|c| c.get("verbose"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        ctx.register_hook(
            Direction::ClientToServer,
            "chat",
            Arc::new(ChatTap {
                counter: self.counter(KEY_CLIENT_CHAT),
                label: "client",
                verbose,
            }),
        );
        ctx.register_hook(
            Direction::ServerToClient,
            "chat",
            Arc::new(ChatTap {
                counter: self.counter(KEY_SERVER_CHAT),
                label: "server",
                verbose,
            }),
        );

        let mut autocomplete = CommandGraph::literal_root("chatstats");
        let root = autocomplete.root();
        autocomplete.set_executable(root, true);
        ctx.register_command(CommandDescriptor {
            name: "chatstats".to_string(),
            description: "Show how much chat the proxy has seen".to_string(),
            autocomplete: Some(autocomplete),
            handler: Arc::new(StatsCommand {
                client: self.counter(KEY_CLIENT_CHAT),
                server: self.counter(KEY_SERVER_CHAT),
            }),
        })?;

        // The preserved timer keeps ticking across reloads; only arm a new
        // one when none is running.
        let timer_running = self
            .state
            .get::<TimerHandle>(KEY_SUMMARY_TIMER)
            .map(|t| !t.is_cleared())
            .unwrap_or(false);
        if !timer_running {
            let timer = ctx.proxy().set_interval(
                "chat summary",
                SUMMARY_INTERVAL,
                ctx.bind_callback(CB_SUMMARY),
            );
            self.state.set(KEY_SUMMARY_TIMER, timer);
        }

        info!(reloading, "chat logger ready");
        Ok(())
    }

    async fn on_unload(&self, _ctx: ModuleContext, reloading: bool) -> Result<(), ModuleError> {
        if !reloading {
            if let Some(timer) = self.state.get::<TimerHandle>(KEY_SUMMARY_TIMER) {
                if !timer.is_cleared() {
                    timer.clear();
                }
            }
        }
        Ok(())
    }

    async fn callback(&self, key: &str, _ctx: ModuleContext) -> Result<(), ModuleError> {
        match key {
            CB_SUMMARY => {
                info!(
                    client = self.counter(KEY_CLIENT_CHAT).load(Ordering::Relaxed),
                    server = self.counter(KEY_SERVER_CHAT).load(Ordering::Relaxed),
                    "chat summary"
                );
                Ok(())
            }
            other => Err(ModuleError::UnknownCallback {
                module: MODULE_NAME.to_string(),
                key: other.to_string(),
            }),
        }
    }
}

declare_module!(ChatLoggerModule);
