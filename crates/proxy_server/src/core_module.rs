//! The built-in core module.
//!
//! Always loaded, never unloaded outside of a reload. It wires the chat
//! command dispatch, both keepalive round-trips, the `declare_commands`
//! rewrite that merges local command autocomplete into the server-declared
//! graph, and the `module` management command.
//!
//! All of its working state lives in reload-preserved cells: the three
//! timer handles, the last sent keepalive halves, the cached command graph
//! and the set of grafted local nodes. Reloading the core module therefore
//! preserves in-flight keepalive timing, with the interval callbacks
//! re-resolved through the module version chain.

use async_trait::async_trait;
use module_system::ModuleFactory;
use serde_json::{json, Value};
use spyglass_event_system::{
    local, CommandContext, CommandDescriptor, CommandError, CommandGraph, CommandHandler,
    CommandRegistry, DeclareCommands, Direction, Event, EventAction, EventError, Module,
    ModuleContext, ModuleError, ModuleState, NodeId, PacketHook, SuggestionProvider, TimerHandle,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const CORE_MODULE_NAME: &str = "core";

const CLIENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const SERVER_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

const KEY_CLIENT_INTERVAL: &str = "client_keep_alive_interval";
const KEY_CLIENT_TIMEOUT: &str = "client_keep_alive_timeout";
const KEY_SERVER_TIMEOUT: &str = "server_keep_alive_timeout";
const KEY_LAST_KEEPALIVE: &str = "last_keep_alive";
const KEY_COMMAND_GRAPH: &str = "command_graph";
const KEY_LOCAL_NODES: &str = "local_command_nodes";

const CB_CLIENT_TICK: &str = "client_keep_alive_tick";
const CB_CLIENT_TIMEOUT: &str = "client_keep_alive_timeout";
const CB_SERVER_TIMEOUT: &str = "server_keep_alive_timeout";

type KeepAliveCell = StdMutex<Option<[u32; 2]>>;
type GraphCell = StdMutex<Option<CommandGraph>>;
type LocalNodesCell = StdMutex<HashMap<String, NodeId>>;

const TWO_POW_32: u64 = 1 << 32;

/// Splits a non-negative millisecond timestamp into the `[high, low]`
/// halves of its unsigned 64-bit representation.
pub(crate) fn split_keep_alive_id(timestamp_ms: u64) -> [u32; 2] {
    [
        (timestamp_ms / TWO_POW_32) as u32,
        (timestamp_ms % TWO_POW_32) as u32,
    ]
}

fn parse_keep_alive_id(data: &Value) -> Option<[u32; 2]> {
    let halves = data.get("keepAliveId")?.as_array()?;
    if halves.len() != 2 {
        return None;
    }
    Some([halves[0].as_u64()? as u32, halves[1].as_u64()? as u32])
}

pub struct CoreModule {
    state: Arc<ModuleState>,
}

impl Default for CoreModule {
    fn default() -> Self {
        let state = Arc::new(ModuleState::new());
        state.set(KEY_LAST_KEEPALIVE, KeepAliveCell::new(None));
        state.set(KEY_COMMAND_GRAPH, GraphCell::new(None));
        state.set(KEY_LOCAL_NODES, LocalNodesCell::new(HashMap::new()));
        Self { state }
    }
}

pub struct CoreModuleFactory;

impl ModuleFactory for CoreModuleFactory {
    fn create(&self) -> Result<Arc<dyn Module>, ModuleError> {
        Ok(Arc::new(CoreModule::default()))
    }
}

fn last_keepalive_cell(state: &ModuleState) -> Arc<KeepAliveCell> {
    state
        .get::<KeepAliveCell>(KEY_LAST_KEEPALIVE)
        .expect("core keepalive cell missing")
}

fn graph_cell(state: &ModuleState) -> Arc<GraphCell> {
    state
        .get::<GraphCell>(KEY_COMMAND_GRAPH)
        .expect("core graph cell missing")
}

fn local_nodes_cell(state: &ModuleState) -> Arc<LocalNodesCell> {
    state
        .get::<LocalNodesCell>(KEY_LOCAL_NODES)
        .expect("core local-nodes cell missing")
}

/// Clears a stored timer, tolerating it never having been armed. The
/// handle stays in the state bag until replaced.
fn clear_timer(state: &ModuleState, key: &str) {
    if let Some(handle) = state.get::<TimerHandle>(key) {
        if !handle.is_cleared() {
            handle.clear();
        }
    }
}

/// Re-merges the registry's autocomplete roots into the cached graph.
///
/// The local-node map tracks the grafted subtree root for each command;
/// every update unlinks all tracked nodes from the graph root, reuses the
/// existing graft for commands that are still registered, grafts new ones
/// and drops stale entries. Repeat applications with an unchanged registry
/// leave the root's child set identical.
fn merge_local_commands(state: &ModuleState, commands: &CommandRegistry) -> Result<(), CommandError> {
    let graph_cell = graph_cell(state);
    let mut graph_guard = graph_cell.lock().expect("graph cell poisoned");
    let Some(graph) = graph_guard.as_mut() else {
        return Ok(());
    };

    let nodes_cell = local_nodes_cell(state);
    let mut tracked = nodes_cell.lock().expect("local nodes cell poisoned");

    let root = graph.root();
    for id in tracked.values() {
        graph.remove_child(root, *id);
    }

    let mut kept = HashMap::new();
    for (name, subtree) in commands.autocomplete_roots() {
        let id = match tracked.get(&name) {
            Some(id) => *id,
            None => graph.graft(&subtree, subtree.root())?,
        };
        graph.add_child(root, id);
        kept.insert(name, id);
    }
    *tracked = kept;
    Ok(())
}

/// Serializes the cached graph for injection, when one is cached.
fn cached_graph_packet(state: &ModuleState) -> Result<Option<Value>, CommandError> {
    let cell = graph_cell(state);
    let guard = cell.lock().expect("graph cell poisoned");
    match guard.as_ref() {
        Some(graph) => Ok(Some(serde_json::to_value(graph.serialize()?)?)),
        None => Ok(None),
    }
}

#[derive(Clone, Copy)]
enum CoreHookKind {
    Chat,
    ClientConnected,
    ClientDisconnected,
    ServerConnected,
    ServerDisconnected,
    ClientKeepAlive,
    ServerKeepAlive,
    DeclareCommands,
}

struct CoreHook {
    kind: CoreHookKind,
    state: Arc<ModuleState>,
    ctx: ModuleContext,
}

#[async_trait]
impl PacketHook for CoreHook {
    async fn handle(&self, event: &mut Event) -> Result<EventAction, EventError> {
        match self.kind {
            CoreHookKind::Chat => self.on_chat(event).await,
            CoreHookKind::ClientConnected => self.on_client_connected().await,
            CoreHookKind::ClientDisconnected => self.on_client_disconnected().await,
            CoreHookKind::ServerConnected => self.on_server_connected().await,
            CoreHookKind::ServerDisconnected => self.on_server_disconnected().await,
            CoreHookKind::ClientKeepAlive => self.on_client_keep_alive(event).await,
            CoreHookKind::ServerKeepAlive => self.on_server_keep_alive(event).await,
            CoreHookKind::DeclareCommands => self.on_declare_commands(event).await,
        }
    }
}

impl CoreHook {
    fn new(kind: CoreHookKind, state: Arc<ModuleState>, ctx: ModuleContext) -> Arc<dyn PacketHook> {
        Arc::new(Self { kind, state, ctx })
    }

    async fn on_chat(&self, event: &mut Event) -> Result<EventAction, EventError> {
        let Some(message) = event.data.get("message").and_then(Value::as_str) else {
            return Ok(EventAction::Continue);
        };
        let proxy = self.ctx.proxy().clone();
        let handled = proxy
            .commands()
            .execute(message, proxy.clone())
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;
        Ok(if handled {
            EventAction::Cancel
        } else {
            EventAction::Continue
        })
    }

    async fn on_client_connected(&self) -> Result<EventAction, EventError> {
        // A failed upstream connect leaves no clientDisconnected behind it;
        // replace any interval still running from that session instead of
        // stacking a second one.
        clear_timer(&self.state, KEY_CLIENT_INTERVAL);
        let interval = self.ctx.proxy().set_interval(
            "client keepalive",
            CLIENT_KEEPALIVE_INTERVAL,
            self.ctx.bind_callback(CB_CLIENT_TICK),
        );
        self.state.set(KEY_CLIENT_INTERVAL, interval);

        // A freshly attached client has not seen the cached command graph.
        match cached_graph_packet(&self.state) {
            Ok(Some(packet)) => {
                if let Err(e) = self.ctx.proxy().inject_client("declare_commands", packet).await {
                    debug!(error = %e, "could not resend cached command graph");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cached command graph is unserializable"),
        }
        Ok(EventAction::Continue)
    }

    async fn on_client_disconnected(&self) -> Result<EventAction, EventError> {
        clear_timer(&self.state, KEY_CLIENT_INTERVAL);
        clear_timer(&self.state, KEY_CLIENT_TIMEOUT);
        *last_keepalive_cell(&self.state)
            .lock()
            .expect("keepalive cell poisoned") = None;
        Ok(EventAction::Continue)
    }

    async fn on_server_connected(&self) -> Result<EventAction, EventError> {
        let timeout = self.ctx.proxy().set_timeout(
            "server keepalive timeout",
            SERVER_KEEPALIVE_TIMEOUT,
            self.ctx.bind_callback(CB_SERVER_TIMEOUT),
        );
        self.state.set(KEY_SERVER_TIMEOUT, timeout);
        Ok(EventAction::Continue)
    }

    async fn on_server_disconnected(&self) -> Result<EventAction, EventError> {
        clear_timer(&self.state, KEY_SERVER_TIMEOUT);
        *graph_cell(&self.state).lock().expect("graph cell poisoned") = None;
        local_nodes_cell(&self.state)
            .lock()
            .expect("local nodes cell poisoned")
            .clear();
        Ok(EventAction::Continue)
    }

    async fn on_client_keep_alive(&self, event: &mut Event) -> Result<EventAction, EventError> {
        let received = parse_keep_alive_id(&event.data);
        let outstanding = last_keepalive_cell(&self.state)
            .lock()
            .expect("keepalive cell poisoned")
            .take();

        match (outstanding, received) {
            (None, _) => warn!("client keep_alive with none outstanding"),
            (Some(sent), Some(echo)) if sent == echo => {
                debug!("client keepalive round-trip complete")
            }
            (Some(sent), echo) => {
                warn!(?sent, ?echo, "client keep_alive id mismatch")
            }
        }

        clear_timer(&self.state, KEY_CLIENT_TIMEOUT);
        Ok(EventAction::Cancel)
    }

    async fn on_server_keep_alive(&self, event: &mut Event) -> Result<EventAction, EventError> {
        // Answer on the client's behalf, then push the dead-server timer out.
        if let Err(e) = self
            .ctx
            .proxy()
            .inject_server("keep_alive", event.data.clone())
            .await
        {
            debug!(error = %e, "could not echo server keep_alive");
        }

        clear_timer(&self.state, KEY_SERVER_TIMEOUT);
        let timeout = self.ctx.proxy().set_timeout(
            "server keepalive timeout",
            SERVER_KEEPALIVE_TIMEOUT,
            self.ctx.bind_callback(CB_SERVER_TIMEOUT),
        );
        self.state.set(KEY_SERVER_TIMEOUT, timeout);
        Ok(EventAction::Cancel)
    }

    async fn on_declare_commands(&self, event: &mut Event) -> Result<EventAction, EventError> {
        let packet: DeclareCommands = serde_json::from_value(event.data.clone())?;
        let graph =
            CommandGraph::deserialize(&packet).map_err(|e| EventError::Handler(e.to_string()))?;

        {
            // Fresh arena: every previously grafted index is void.
            local_nodes_cell(&self.state)
                .lock()
                .expect("local nodes cell poisoned")
                .clear();
            *graph_cell(&self.state).lock().expect("graph cell poisoned") = Some(graph);
        }

        let proxy = self.ctx.proxy();
        merge_local_commands(&self.state, proxy.commands())
            .map_err(|e| EventError::Handler(e.to_string()))?;

        let packet = cached_graph_packet(&self.state)
            .map_err(|e| EventError::Handler(e.to_string()))?
            .expect("graph cached above");
        proxy
            .inject_client("declare_commands", packet)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;

        Ok(EventAction::Cancel)
    }
}

/// `module load|unload|reload <name>` and `module import <path>`.
struct ModuleCommand {
    state: Arc<ModuleState>,
}

impl ModuleCommand {
    /// After a successful module operation the local command set may have
    /// changed; refresh the merged graph and push it to the client.
    async fn refresh_command_graph(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        merge_local_commands(&self.state, ctx.proxy().commands())?;
        if let Some(packet) = cached_graph_packet(&self.state)? {
            if let Err(e) = ctx.proxy().inject_client("declare_commands", packet).await {
                debug!(error = %e, "could not push refreshed command graph");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for ModuleCommand {
    async fn handle(&self, ctx: CommandContext) -> Result<(), CommandError> {
        const USAGE: &str = "Usage: module <load|unload|reload> <name> | module import <path>";

        let action = ctx.args.get(1).map(String::as_str);
        let target = ctx.args.get(2).map(String::as_str);

        let result: Result<String, ModuleError> = match (action, target) {
            (Some("load"), Some(name)) => ctx
                .proxy()
                .load_module(name)
                .await
                .map(|_| format!("Module {name} loaded")),
            (Some("unload"), Some(name)) => ctx
                .proxy()
                .unload_module(name)
                .await
                .map(|_| format!("Module {name} unloaded")),
            (Some("reload"), Some(name)) => ctx
                .proxy()
                .reload_module(name)
                .await
                .map(|_| format!("Module {name} reloaded")),
            (Some("import"), Some(path)) => ctx
                .proxy()
                .import_module(path)
                .await
                .map(|name| format!("Imported module {name}")),
            _ => return ctx.reply(USAGE).await,
        };

        match result {
            Ok(message) => {
                self.refresh_command_graph(&ctx).await?;
                ctx.reply(&message).await
            }
            Err(e) => {
                ctx.reply_component(json!({ "text": e.to_string(), "color": "red" }))
                    .await
            }
        }
    }
}

fn module_command_graph() -> CommandGraph {
    let mut graph = CommandGraph::literal_root("module");
    let root = graph.root();

    for action in ["load", "unload", "reload"] {
        let action_node = graph.literal(root, action);
        let name = graph.argument(action_node, "name", "brigadier:string", Some(json!(0)));
        graph.set_executable(name, true);
        graph.set_suggestions(name, SuggestionProvider::AskServer);
    }

    let import = graph.literal(root, "import");
    let path = graph.argument(import, "path", "brigadier:string", Some(json!(2)));
    graph.set_executable(path, true);

    graph
}

#[async_trait]
impl Module for CoreModule {
    fn name(&self) -> &str {
        CORE_MODULE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn state_preserve_keys(&self) -> &'static [&'static str] {
        &[
            KEY_CLIENT_INTERVAL,
            KEY_CLIENT_TIMEOUT,
            KEY_SERVER_TIMEOUT,
            KEY_LAST_KEEPALIVE,
            KEY_COMMAND_GRAPH,
            KEY_LOCAL_NODES,
        ]
    }

    async fn on_load(&self, ctx: ModuleContext, _reloading: bool) -> Result<(), ModuleError> {
        use CoreHookKind::*;
        use Direction::*;

        let hooks: [(Direction, &str, CoreHookKind); 8] = [
            (ClientToServer, "chat", Chat),
            (ClientToServer, "keep_alive", ClientKeepAlive),
            (ServerToClient, "keep_alive", ServerKeepAlive),
            (ServerToClient, "declare_commands", DeclareCommands),
            (Local, local::CLIENT_CONNECTED, ClientConnected),
            (Local, local::CLIENT_DISCONNECTED, ClientDisconnected),
            (Local, local::SERVER_CONNECTED, ServerConnected),
            (Local, local::SERVER_DISCONNECTED, ServerDisconnected),
        ];
        for (scope, kind, hook) in hooks {
            ctx.register_hook(
                scope,
                kind,
                CoreHook::new(hook, self.state.clone(), ctx.clone()),
            );
        }

        ctx.register_command(CommandDescriptor {
            name: "module".to_string(),
            description: "Load, unload, reload or import proxy modules".to_string(),
            autocomplete: Some(module_command_graph()),
            handler: Arc::new(ModuleCommand {
                state: self.state.clone(),
            }),
        })?;

        Ok(())
    }

    async fn callback(&self, key: &str, ctx: ModuleContext) -> Result<(), ModuleError> {
        match key {
            CB_CLIENT_TICK => self.client_keepalive_tick(ctx).await,
            CB_CLIENT_TIMEOUT => self.client_keepalive_timed_out(ctx).await,
            CB_SERVER_TIMEOUT => self.server_keepalive_timed_out(ctx).await,
            other => Err(ModuleError::UnknownCallback {
                module: CORE_MODULE_NAME.to_string(),
                key: other.to_string(),
            }),
        }
    }
}

impl CoreModule {
    async fn client_keepalive_tick(&self, ctx: ModuleContext) -> Result<(), ModuleError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let halves = split_keep_alive_id(now_ms);

        *last_keepalive_cell(&self.state)
            .lock()
            .expect("keepalive cell poisoned") = Some(halves);

        if let Err(e) = ctx
            .proxy()
            .inject_client("keep_alive", json!({ "keepAliveId": halves }))
            .await
        {
            // The client can vanish between the firing and the injection.
            debug!(error = %e, "keepalive ping skipped");
            return Ok(());
        }

        // An unanswered timeout from the previous ping must keep running;
        // re-arming it here would let a silent client linger forever.
        let outstanding = self
            .state
            .get::<TimerHandle>(KEY_CLIENT_TIMEOUT)
            .map(|handle| !handle.is_cleared())
            .unwrap_or(false);
        if !outstanding {
            let timeout = ctx.proxy().set_timeout(
                "client keepalive timeout",
                CLIENT_KEEPALIVE_TIMEOUT,
                ctx.bind_callback(CB_CLIENT_TIMEOUT),
            );
            self.state.set(KEY_CLIENT_TIMEOUT, timeout);
        }
        Ok(())
    }

    async fn client_keepalive_timed_out(&self, ctx: ModuleContext) -> Result<(), ModuleError> {
        warn!("client missed its keepalive window, disconnecting");
        if let Err(e) = ctx
            .proxy()
            .disconnect_client(Some("Timed out".to_string()))
            .await
        {
            debug!(error = %e, "client already gone");
        }
        Ok(())
    }

    async fn server_keepalive_timed_out(&self, ctx: ModuleContext) -> Result<(), ModuleError> {
        warn!("server went silent past the keepalive window, disconnecting upstream");
        if let Err(e) = ctx.proxy().disconnect_server(Some(String::new())).await {
            debug!(error = %e, "upstream already gone");
        }
        Ok(())
    }
}
