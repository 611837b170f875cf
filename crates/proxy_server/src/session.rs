//! The proxy connection core.
//!
//! [`ProxyCore`] owns the hook pipeline, the command registry and the module
//! registry, and runs the dual-connection state machine for the single
//! proxied client. All packet hooks, local lifecycle hooks and timer
//! callbacks execute on one loop task, one event at a time: the pipeline's
//! ordering guarantees depend on that single logical execution context, so
//! nothing here runs hooks concurrently.
//!
//! Reader tasks pump transport events into the loop tagged with a session
//! epoch; events from a torn-down session are fenced out by the epoch
//! check.

use crate::auth::SessionCredentials;
use crate::config::ProxyConfig;
use crate::transport::{PacketMeta, PacketSink, PacketStream, TransportEvent};
use crate::upstream::UpstreamConnector;
use async_trait::async_trait;
use compact_str::CompactString;
use module_system::ModuleRegistry;
use serde_json::{json, Value};
use spyglass_event_system::{
    local, BoundCallback, CommandRegistry, ContextError, Direction, Event, HookPipeline,
    ModuleError, ProxyContext, TimerHandle,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Connection lifecycle of the proxied session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    ClientConnected,
    Authenticating,
    ConnectingUpstream,
    Connected,
    Proxying,
    Teardown,
}

#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

enum TeardownCause {
    /// The client side went away; the upstream is closed with an empty
    /// reason.
    ClientLost,
    /// The upstream went away (or failed to connect); the client is kicked
    /// with the received reason.
    ServerLost(Option<String>),
}

pub(crate) enum LoopEvent {
    ClientAccepted {
        stream: Box<dyn PacketStream>,
        sink: Arc<dyn PacketSink>,
    },
    Client {
        epoch: u64,
        event: TransportEvent,
    },
    Server {
        epoch: u64,
        event: TransportEvent,
    },
    Timer {
        label: CompactString,
        cancelled: Arc<AtomicBool>,
        callback: BoundCallback,
    },
    Shutdown,
}

struct SessionShared {
    phase: SessionPhase,
    epoch: u64,
    client_sink: Option<Arc<dyn PacketSink>>,
    server_sink: Option<Arc<dyn PacketSink>>,
    client_disconnect_fired: bool,
    server_disconnect_fired: bool,
}

/// The proxy instance: registries plus the session state machine.
pub struct ProxyCore {
    self_ref: Weak<ProxyCore>,
    config: ProxyConfig,
    credentials: SessionCredentials,
    hooks: HookPipeline,
    commands: CommandRegistry,
    modules: Arc<ModuleRegistry>,
    connector: Arc<dyn UpstreamConnector>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    shared: RwLock<SessionShared>,
    /// `PROXY_DEBUG=1` packet tap; the set filters by packet type name and
    /// an empty set means everything.
    debug_types: Option<HashSet<String>>,
}

impl ProxyCore {
    /// Builds the core and spawns its event loop.
    pub fn new(config: ProxyConfig, connector: Arc<dyn UpstreamConnector>) -> Arc<Self> {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let credentials = SessionCredentials::from_config(&config);
        let commands = CommandRegistry::new(&config.command_prefix);

        let debug_types = match std::env::var("PROXY_DEBUG") {
            Ok(flag) if flag == "1" => {
                let types = std::env::var("PROXY_DEBUG_TYPES").unwrap_or_default();
                Some(
                    types
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect::<HashSet<String>>(),
                )
            }
            _ => None,
        };

        let core = Arc::new_cyclic(|weak: &Weak<ProxyCore>| Self {
            self_ref: weak.clone(),
            config,
            credentials,
            hooks: HookPipeline::new(),
            commands,
            modules: Arc::new(ModuleRegistry::new()),
            connector,
            loop_tx,
            shared: RwLock::new(SessionShared {
                phase: SessionPhase::Idle,
                epoch: 0,
                client_sink: None,
                server_sink: None,
                client_disconnect_fired: false,
                server_disconnect_fired: false,
            }),
            debug_types,
        });

        tokio::spawn(Self::run(core.clone(), loop_rx));
        core
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn hook_pipeline(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn command_registry(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.read().expect("session lock poisoned").phase
    }

    /// This core as the context seam handed to modules.
    pub fn context(&self) -> Arc<dyn ProxyContext> {
        let core: Arc<dyn ProxyContext> =
            self.self_ref.upgrade().expect("proxy core dropped while in use");
        core
    }

    /// Hands an accepted client connection to the session loop.
    pub fn accept_client(&self, stream: Box<dyn PacketStream>, sink: Arc<dyn PacketSink>) {
        let _ = self.loop_tx.send(LoopEvent::ClientAccepted { stream, sink });
    }

    /// Asks the loop to tear down any session and exit.
    pub fn shutdown(&self) {
        let _ = self.loop_tx.send(LoopEvent::Shutdown);
    }

    async fn run(core: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                LoopEvent::ClientAccepted { stream, sink } => {
                    core.handle_client_accepted(stream, sink).await;
                }
                LoopEvent::Client { epoch, event } => {
                    core.handle_client_event(epoch, event).await;
                }
                LoopEvent::Server { epoch, event } => {
                    core.handle_server_event(epoch, event).await;
                }
                LoopEvent::Timer {
                    label,
                    cancelled,
                    callback,
                } => {
                    // The handle may have been cleared after this firing was
                    // queued; a cleared timer never invokes its callback.
                    if cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = callback.invoke(core.context()).await {
                        error!(timer = %label, error = %e, "timer callback failed");
                    }
                }
                LoopEvent::Shutdown => {
                    core.teardown(TeardownCause::ClientLost).await;
                    break;
                }
            }
        }
        debug!("proxy event loop stopped");
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.shared.write().expect("session lock poisoned").phase = phase;
    }

    fn spawn_reader(&self, mut stream: Box<dyn PacketStream>, epoch: u64, side: Side) {
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let wrapped = match side {
                    Side::Client => LoopEvent::Client { epoch, event },
                    Side::Server => LoopEvent::Server { epoch, event },
                };
                if tx.send(wrapped).is_err() {
                    break;
                }
            }
        });
    }

    async fn handle_client_accepted(
        &self,
        stream: Box<dyn PacketStream>,
        sink: Arc<dyn PacketSink>,
    ) {
        let busy = self
            .shared
            .read()
            .expect("session lock poisoned")
            .client_sink
            .is_some();
        if busy {
            warn!("rejecting additional client: one session is already proxied");
            let reason = json!({ "text": "Too many connections" }).to_string();
            if let Err(e) = sink.write("kick_disconnect", json!({ "reason": reason })).await {
                debug!(error = %e, "could not deliver rejection kick");
            }
            let _ = sink.close(Some("too many connections".to_string())).await;
            return;
        }

        let epoch = {
            let mut shared = self.shared.write().expect("session lock poisoned");
            shared.epoch += 1;
            shared.phase = SessionPhase::ClientConnected;
            shared.client_sink = Some(sink);
            shared.client_disconnect_fired = false;
            shared.server_disconnect_fired = false;
            shared.epoch
        };
        self.spawn_reader(stream, epoch, Side::Client);
        info!("client attached");

        self.run_local_hooks(local::CLIENT_CONNECTED, json!({})).await;
        self.set_phase(SessionPhase::Authenticating);
        self.run_local_hooks(local::BEFORE_SERVER_CONNECT, json!({})).await;
        self.set_phase(SessionPhase::ConnectingUpstream);

        match self.connector.connect(&self.credentials).await {
            Ok((server_stream, server_sink)) => {
                self.shared
                    .write()
                    .expect("session lock poisoned")
                    .server_sink = Some(server_sink);
                self.spawn_reader(server_stream, epoch, Side::Server);
                debug!("upstream transport established, awaiting login");
            }
            Err(e) => {
                error!(error = %e, "upstream connection failed");
                self.upstream_connect_failed(e.to_string()).await;
            }
        }
    }

    async fn handle_client_event(&self, epoch: u64, event: TransportEvent) {
        if self.shared.read().expect("session lock poisoned").epoch != epoch {
            return;
        }
        match event {
            TransportEvent::Packet { data, meta } => {
                if self.phase() != SessionPhase::Proxying {
                    trace!(packet = %meta.name, "dropping client packet outside play");
                    return;
                }
                self.pump(Direction::ClientToServer, meta, data).await;
            }
            TransportEvent::State(state) => trace!(%state, "client protocol state"),
            TransportEvent::Login => {}
            TransportEvent::End(reason) => {
                info!(?reason, "client disconnected");
                self.teardown(TeardownCause::ClientLost).await;
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "client transport error");
                self.teardown(TeardownCause::ClientLost).await;
            }
        }
    }

    async fn handle_server_event(&self, epoch: u64, event: TransportEvent) {
        if self.shared.read().expect("session lock poisoned").epoch != epoch {
            return;
        }
        match event {
            TransportEvent::Login => {
                info!("upstream login succeeded");
                self.set_phase(SessionPhase::Connected);
                self.run_local_hooks(local::SERVER_CONNECTED, json!({})).await;
            }
            TransportEvent::State(state) => {
                trace!(%state, "upstream protocol state");
                if state == "play" {
                    info!("session proxying");
                    self.set_phase(SessionPhase::Proxying);
                }
            }
            TransportEvent::Packet { data, meta } => {
                if self.phase() != SessionPhase::Proxying {
                    trace!(packet = %meta.name, "dropping server packet outside play");
                    return;
                }
                self.pump(Direction::ServerToClient, meta, data).await;
            }
            TransportEvent::End(reason) => {
                info!(?reason, "upstream closed the connection");
                self.teardown(TeardownCause::ServerLost(reason)).await;
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "upstream transport error");
                self.teardown(TeardownCause::ServerLost(Some(e))).await;
            }
        }
    }

    /// Runs one packet through the pipeline and forwards it to the opposite
    /// peer unless a hook cancelled it. Hook failures suppress the packet
    /// and are logged; they never tear the session down by themselves.
    async fn pump(&self, direction: Direction, meta: PacketMeta, data: Value) {
        if let Some(types) = &self.debug_types {
            if types.is_empty() || types.contains(meta.name.as_str()) {
                debug!(%direction, packet = %meta.name, data = %data, "packet");
            }
        }

        let mut event = Event::new(direction, &meta.name, data);
        let forward = match self.hooks.execute(&mut event).await {
            Ok(forward) => forward,
            Err(e) => {
                error!(%direction, packet = %meta.name, error = %e, "hook pipeline failed, packet suppressed");
                return;
            }
        };
        if !forward {
            return;
        }

        let sink = {
            let shared = self.shared.read().expect("session lock poisoned");
            match direction {
                Direction::ClientToServer => shared.server_sink.clone(),
                Direction::ServerToClient => shared.client_sink.clone(),
                Direction::Local => None,
            }
        };
        let Some(sink) = sink else {
            return;
        };

        if let Err(e) = sink.write(&meta.name, event.into_data()).await {
            warn!(%direction, error = %e, "forward failed, tearing session down");
            match direction {
                Direction::ClientToServer => {
                    self.teardown(TeardownCause::ServerLost(Some(e.to_string())))
                        .await;
                }
                _ => self.teardown(TeardownCause::ClientLost).await,
            }
        }
    }

    async fn run_local_hooks(&self, kind: &str, data: Value) {
        let mut event = Event::new(Direction::Local, kind, data);
        if let Err(e) = self.hooks.execute(&mut event).await {
            error!(event = kind, error = %e, "local hook failed");
        }
    }

    /// Failure while connecting upstream: the server-side disconnect hooks
    /// fire and the pending client is cleared, then the core returns to
    /// `Idle`. The client is not kicked and `clientDisconnected` does not
    /// fire; the client never reached play and its transport closes when
    /// the dropped sink goes away.
    async fn upstream_connect_failed(&self, reason: String) {
        {
            let mut shared = self.shared.write().expect("session lock poisoned");
            shared.phase = SessionPhase::Teardown;
            shared.client_sink = None;
            shared.server_sink = None;
            shared.server_disconnect_fired = true;
        }
        self.run_local_hooks(local::SERVER_DISCONNECTED, json!({ "reason": reason }))
            .await;
        self.set_phase(SessionPhase::Idle);
        info!("session closed");
    }

    /// Tears the session down, firing each side's disconnect hooks exactly
    /// once, and returns the core to `Idle`.
    async fn teardown(&self, cause: TeardownCause) {
        let (client_sink, server_sink, fire_client, fire_server) = {
            let mut shared = self.shared.write().expect("session lock poisoned");
            if shared.client_sink.is_none() && shared.server_sink.is_none() {
                return;
            }
            shared.phase = SessionPhase::Teardown;
            let client_sink = shared.client_sink.take();
            let server_sink = shared.server_sink.take();
            let fire_client = client_sink.is_some() && !shared.client_disconnect_fired;
            let fire_server = server_sink.is_some() && !shared.server_disconnect_fired;
            shared.client_disconnect_fired |= fire_client;
            shared.server_disconnect_fired |= fire_server;
            (client_sink, server_sink, fire_client, fire_server)
        };

        let client_kick_reason = match &cause {
            TeardownCause::ClientLost => None,
            TeardownCause::ServerLost(reason) => Some(reason.clone().unwrap_or_default()),
        };

        if let Some(sink) = &client_sink {
            if let Some(reason) = &client_kick_reason {
                let component = json!({ "text": reason }).to_string();
                let _ = sink
                    .write("kick_disconnect", json!({ "reason": component }))
                    .await;
            }
            let _ = sink.close(client_kick_reason.clone()).await;
        }
        if let Some(sink) = &server_sink {
            let _ = sink.close(None).await;
        }

        match &cause {
            TeardownCause::ClientLost => {
                if fire_client {
                    self.run_local_hooks(local::CLIENT_DISCONNECTED, json!({})).await;
                }
                if fire_server {
                    self.run_local_hooks(local::SERVER_DISCONNECTED, json!({ "reason": Value::Null }))
                        .await;
                }
            }
            TeardownCause::ServerLost(reason) => {
                if fire_server {
                    self.run_local_hooks(local::SERVER_DISCONNECTED, json!({ "reason": reason }))
                        .await;
                }
                if fire_client {
                    self.run_local_hooks(local::CLIENT_DISCONNECTED, json!({})).await;
                }
            }
        }

        self.set_phase(SessionPhase::Idle);
        info!("session closed");
    }
}

#[async_trait]
impl ProxyContext for ProxyCore {
    fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    fn module_config(&self, module: &str) -> Option<Value> {
        self.config.module_config.get(module).cloned()
    }

    async fn inject_client(&self, kind: &str, data: Value) -> Result<(), ContextError> {
        let sink = self
            .shared
            .read()
            .expect("session lock poisoned")
            .client_sink
            .clone()
            .ok_or(ContextError::NoClientConnection)?;
        sink.write(kind, data)
            .await
            .map_err(|e| ContextError::Transport(e.to_string()))
    }

    async fn inject_server(&self, kind: &str, data: Value) -> Result<(), ContextError> {
        let sink = self
            .shared
            .read()
            .expect("session lock poisoned")
            .server_sink
            .clone()
            .ok_or(ContextError::NoServerConnection)?;
        sink.write(kind, data)
            .await
            .map_err(|e| ContextError::Transport(e.to_string()))
    }

    fn set_interval(&self, label: &str, period: Duration, callback: BoundCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let tx = self.loop_tx.clone();
        let task_label = CompactString::new(label);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let send = tx.send(LoopEvent::Timer {
                    label: task_label.clone(),
                    cancelled: flag.clone(),
                    callback: callback.clone(),
                });
                if send.is_err() {
                    break;
                }
            }
        });
        TimerHandle::new(label, cancelled, task)
    }

    fn set_timeout(&self, label: &str, delay: Duration, callback: BoundCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let tx = self.loop_tx.clone();
        let task_label = CompactString::new(label);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(LoopEvent::Timer {
                label: task_label,
                cancelled: flag,
                callback,
            });
        });
        TimerHandle::new(label, cancelled, task)
    }

    async fn disconnect_client(&self, reason: Option<String>) -> Result<(), ContextError> {
        let (epoch, sink) = {
            let shared = self.shared.read().expect("session lock poisoned");
            (shared.epoch, shared.client_sink.clone())
        };
        let sink = sink.ok_or(ContextError::NoClientConnection)?;
        if let Some(reason) = &reason {
            let component = json!({ "text": reason }).to_string();
            let _ = sink
                .write("kick_disconnect", json!({ "reason": component }))
                .await;
        }
        let _ = self.loop_tx.send(LoopEvent::Client {
            epoch,
            event: TransportEvent::End(reason),
        });
        Ok(())
    }

    async fn disconnect_server(&self, reason: Option<String>) -> Result<(), ContextError> {
        let (epoch, sink) = {
            let shared = self.shared.read().expect("session lock poisoned");
            (shared.epoch, shared.server_sink.clone())
        };
        if sink.is_none() {
            return Err(ContextError::NoServerConnection);
        }
        let _ = self.loop_tx.send(LoopEvent::Server {
            epoch,
            event: TransportEvent::End(reason),
        });
        Ok(())
    }

    async fn load_module(&self, name: &str) -> Result<(), ModuleError> {
        self.modules.load(name, self.context()).await
    }

    async fn unload_module(&self, name: &str) -> Result<(), ModuleError> {
        self.modules.unload(name, self.context()).await
    }

    async fn reload_module(&self, name: &str) -> Result<(), ModuleError> {
        self.modules.reload(name, self.context()).await
    }

    async fn import_module(&self, path: &str) -> Result<String, ModuleError> {
        self.modules
            .import_from_path(std::path::Path::new(path), &self.context())
    }
}
