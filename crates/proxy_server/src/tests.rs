//! End-to-end session tests over the in-memory transport pair.

use crate::auth::SessionCredentials;
use crate::config::ProxyConfig;
use crate::error::TransportError;
use crate::server;
use crate::session::{ProxyCore, SessionPhase};
use crate::transport::memory::{memory_link, MemoryEndpoint};
use crate::transport::{PacketSink, PacketStream, TransportEvent};
use crate::upstream::UpstreamConnector;
use async_trait::async_trait;
use serde_json::{json, Value};
use spyglass_event_system::{
    local, sync_hook, CommandContext, CommandDescriptor, CommandError, CommandGraph,
    CommandHandler, DeclareCommands, Direction, EventAction,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

struct QueueConnector {
    pending: StdMutex<Vec<MemoryEndpoint>>,
}

impl QueueConnector {
    fn with_endpoint(endpoint: MemoryEndpoint) -> Arc<Self> {
        Arc::new(Self {
            pending: StdMutex::new(vec![endpoint]),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            pending: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl UpstreamConnector for QueueConnector {
    async fn connect(
        &self,
        _credentials: &SessionCredentials,
    ) -> Result<(Box<dyn PacketStream>, Arc<dyn PacketSink>), TransportError> {
        let endpoint = self
            .pending
            .lock()
            .unwrap()
            .pop()
            .ok_or(TransportError::Closed)?;
        let stream: Box<dyn PacketStream> = Box::new(endpoint.stream);
        let sink: Arc<dyn PacketSink> = Arc::new(endpoint.sink);
        Ok((stream, sink))
    }
}

async fn wait_for_phase(core: &Arc<ProxyCore>, phase: SessionPhase) {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if core.phase() == phase {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for session phase");
}

/// Boots a proxied session over memory links: returns the core, the peer
/// acting as the game client, and the peer acting as the upstream server.
async fn start_proxy() -> (Arc<ProxyCore>, MemoryEndpoint, MemoryEndpoint) {
    let mut config = ProxyConfig::default();
    config.server_address = "upstream.test".to_string();

    let (upstream_side, server_peer) = memory_link();
    let core = ProxyCore::new(config, QueueConnector::with_endpoint(upstream_side));
    server::bootstrap(&core).await.unwrap();

    let (client_side, client_peer) = memory_link();
    core.accept_client(Box::new(client_side.stream), Arc::new(client_side.sink));

    server_peer.sink.send_event(TransportEvent::Login).unwrap();
    server_peer
        .sink
        .send_event(TransportEvent::State("play".to_string()))
        .unwrap();

    wait_for_phase(&core, SessionPhase::Proxying).await;
    (core, client_peer, server_peer)
}

/// Reads the next packet off a peer, failing on anything else.
async fn expect_packet(endpoint: &mut MemoryEndpoint, name: &str) -> Value {
    let event = tokio::time::timeout(Duration::from_secs(60), endpoint.stream.next())
        .await
        .expect("timed out waiting for a packet")
        .expect("transport ended unexpectedly");
    match event {
        TransportEvent::Packet { data, meta } => {
            assert_eq!(meta.name, name, "unexpected packet {}", meta.name);
            data
        }
        other => panic!("unexpected transport event: {other:?}"),
    }
}

struct ReplyHandler {
    reply: &'static str,
}

#[async_trait]
impl CommandHandler for ReplyHandler {
    async fn handle(&self, ctx: CommandContext) -> Result<(), CommandError> {
        ctx.reply(self.reply).await
    }
}

struct NoopHandler;

#[async_trait]
impl CommandHandler for NoopHandler {
    async fn handle(&self, _ctx: CommandContext) -> Result<(), CommandError> {
        Ok(())
    }
}

#[tokio::test]
async fn proxy_command_is_answered_and_suppressed() {
    let (core, mut client_peer, mut server_peer) = start_proxy().await;

    core.command_registry()
        .register(CommandDescriptor {
            name: "test".to_string(),
            description: String::new(),
            autocomplete: None,
            handler: Arc::new(ReplyHandler { reply: "HI" }),
        })
        .unwrap();

    client_peer
        .sink
        .write("chat", json!({ "message": "/p:test" }))
        .await
        .unwrap();

    let data = expect_packet(&mut client_peer, "chat").await;
    let component: Value = serde_json::from_str(data["message"].as_str().unwrap()).unwrap();
    assert_eq!(component, json!({ "text": "HI" }));

    // Ordinary chat still flows, and it is the first thing the upstream
    // sees: the command never crossed.
    client_peer
        .sink
        .write("chat", json!({ "message": "hello" }))
        .await
        .unwrap();
    let data = expect_packet(&mut server_peer, "chat").await;
    assert_eq!(data["message"], json!("hello"));
}

#[tokio::test]
async fn unprefixed_chat_is_forwarded() {
    let (_core, client_peer, mut server_peer) = start_proxy().await;

    client_peer
        .sink
        .write("chat", json!({ "message": "just chatting" }))
        .await
        .unwrap();
    let data = expect_packet(&mut server_peer, "chat").await;
    assert_eq!(data["message"], json!("just chatting"));
}

#[tokio::test]
async fn hooks_mutate_forwarded_packets() {
    let (core, client_peer, mut server_peer) = start_proxy().await;

    core.hook_pipeline().register_with_priority(
        Direction::ClientToServer,
        "chat",
        50,
        sync_hook(|event| {
            event.data["message"] = json!("censored");
            Ok(EventAction::Continue)
        }),
    );

    client_peer
        .sink
        .write("chat", json!({ "message": "original" }))
        .await
        .unwrap();
    let data = expect_packet(&mut server_peer, "chat").await;
    assert_eq!(data["message"], json!("censored"));
}

#[tokio::test(start_paused = true)]
async fn keepalive_round_trip() {
    let (core, mut client_peer, mut server_peer) = start_proxy().await;

    // First ping arrives after the 15 s interval (virtual time).
    let data = expect_packet(&mut client_peer, "keep_alive").await;
    let halves = data["keepAliveId"].as_array().unwrap().clone();
    assert_eq!(halves.len(), 2);

    // Matching echo: consumed by the proxy, never forwarded upstream.
    client_peer
        .sink
        .write("keep_alive", json!({ "keepAliveId": halves }))
        .await
        .unwrap();
    client_peer
        .sink
        .write("chat", json!({ "message": "marker" }))
        .await
        .unwrap();
    let first_upstream = expect_packet(&mut server_peer, "chat").await;
    assert_eq!(first_upstream["message"], json!("marker"));

    // Feed the upstream's own keepalive supervision so its 30 s timeout
    // does not fire while virtual time advances to the next client cycle.
    server_peer
        .sink
        .write("keep_alive", json!({ "keepAliveId": [7, 7] }))
        .await
        .unwrap();
    let echoed = expect_packet(&mut server_peer, "keep_alive").await;
    assert_eq!(echoed["keepAliveId"], json!([7, 7]));

    // Next cycle: a mismatched echo is logged but also consumed, and the
    // session stays up.
    let data = expect_packet(&mut client_peer, "keep_alive").await;
    let halves = data["keepAliveId"].as_array().unwrap();
    let high = halves[0].as_u64().unwrap();
    let low = halves[1].as_u64().unwrap();
    client_peer
        .sink
        .write("keep_alive", json!({ "keepAliveId": [high, low + 1] }))
        .await
        .unwrap();
    client_peer
        .sink
        .write("chat", json!({ "message": "marker2" }))
        .await
        .unwrap();
    let second_upstream = expect_packet(&mut server_peer, "chat").await;
    assert_eq!(second_upstream["message"], json!("marker2"));
    assert_eq!(core.phase(), SessionPhase::Proxying);
}

#[tokio::test(start_paused = true)]
async fn silent_client_is_timed_out() {
    let (core, mut client_peer, server_peer) = start_proxy().await;

    let mut saw_kick = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(300), client_peer.stream.next())
            .await
            .expect("timed out waiting for the keepalive kick")
            .expect("stream ended without an End event");
        match event {
            TransportEvent::Packet { meta, data } if meta.name == "kick_disconnect" => {
                assert!(data["reason"].as_str().unwrap().contains("Timed out"));
                saw_kick = true;
            }
            TransportEvent::Packet { meta, .. } => {
                assert_eq!(meta.name, "keep_alive");
                // Keep the upstream's supervision fed; only the client is
                // supposed to time out in this scenario.
                server_peer
                    .sink
                    .write("keep_alive", json!({ "keepAliveId": [1, 1] }))
                    .await
                    .unwrap();
            }
            TransportEvent::End(_) => break,
            other => panic!("unexpected transport event: {other:?}"),
        }
    }
    assert!(saw_kick);
    wait_for_phase(&core, SessionPhase::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn server_keep_alive_is_echoed_not_forwarded() {
    let (core, _client_peer, mut server_peer) = start_proxy().await;

    server_peer
        .sink
        .write("keep_alive", json!({ "keepAliveId": [3, 14] }))
        .await
        .unwrap();

    // The echo goes back upstream...
    let echoed = expect_packet(&mut server_peer, "keep_alive").await;
    assert_eq!(echoed["keepAliveId"], json!([3, 14]));
    // ...and the session stays in play.
    assert_eq!(core.phase(), SessionPhase::Proxying);
}

#[tokio::test]
async fn declare_commands_merge_rewrites_packet() {
    let (core, mut client_peer, server_peer) = start_proxy().await;

    core.command_registry()
        .register(CommandDescriptor {
            name: "foo".to_string(),
            description: String::new(),
            autocomplete: Some(CommandGraph::literal_root("foo")),
            handler: Arc::new(NoopHandler),
        })
        .unwrap();

    let server_graph = {
        let mut graph = CommandGraph::new();
        let say = graph.literal(graph.root(), "say");
        graph.set_executable(say, true);
        serde_json::to_value(graph.serialize().unwrap()).unwrap()
    };
    server_peer
        .sink
        .write("declare_commands", server_graph)
        .await
        .unwrap();

    // The client receives the rewritten graph; the original was cancelled.
    let data = expect_packet(&mut client_peer, "declare_commands").await;
    let packet: DeclareCommands = serde_json::from_value(data).unwrap();
    let graph = CommandGraph::deserialize(&packet).unwrap();

    let mut names: Vec<String> = graph
        .node(graph.root())
        .unwrap()
        .children
        .iter()
        .map(|c| graph.node(*c).unwrap().name.clone().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["p:foo".to_string(), "say".into()]);
}

#[tokio::test]
async fn second_client_is_rejected() {
    let (core, _client_peer, _server_peer) = start_proxy().await;

    let (second_side, mut second_peer) = memory_link();
    core.accept_client(Box::new(second_side.stream), Arc::new(second_side.sink));

    let data = expect_packet(&mut second_peer, "kick_disconnect").await;
    assert!(data["reason"].as_str().unwrap().contains("Too many connections"));
    match tokio::time::timeout(Duration::from_secs(60), second_peer.stream.next())
        .await
        .unwrap()
    {
        Some(TransportEvent::End(_)) => {}
        other => panic!("expected End, got {other:?}"),
    }

    // The original session is untouched.
    assert_eq!(core.phase(), SessionPhase::Proxying);
}

#[tokio::test]
async fn disconnect_hooks_fire_exactly_once_per_side() {
    let (core, client_peer, mut server_peer) = start_proxy().await;

    let client_count = Arc::new(AtomicU32::new(0));
    let server_count = Arc::new(AtomicU32::new(0));
    {
        let count = client_count.clone();
        core.hook_pipeline().register(
            Direction::Local,
            local::CLIENT_DISCONNECTED,
            sync_hook(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(EventAction::Continue)
            }),
        );
        let count = server_count.clone();
        core.hook_pipeline().register(
            Direction::Local,
            local::SERVER_DISCONNECTED,
            sync_hook(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(EventAction::Continue)
            }),
        );
    }

    client_peer.sink.send_event(TransportEvent::End(None)).unwrap();
    wait_for_phase(&core, SessionPhase::Idle).await;

    // The upstream transport was closed as part of the teardown.
    match tokio::time::timeout(Duration::from_secs(60), server_peer.stream.next())
        .await
        .unwrap()
    {
        Some(TransportEvent::End(_)) => {}
        other => panic!("expected End, got {other:?}"),
    }

    // Give any straggler events a chance to be (wrongly) processed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client_count.load(Ordering::SeqCst), 1);
    assert_eq!(server_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_failure_returns_to_idle() {
    let mut config = ProxyConfig::default();
    config.server_address = "upstream.test".to_string();
    let core = ProxyCore::new(config, QueueConnector::empty());
    server::bootstrap(&core).await.unwrap();

    let server_disconnects = Arc::new(AtomicU32::new(0));
    let client_disconnects = Arc::new(AtomicU32::new(0));
    {
        let count = server_disconnects.clone();
        core.hook_pipeline().register(
            Direction::Local,
            local::SERVER_DISCONNECTED,
            sync_hook(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(EventAction::Continue)
            }),
        );
        let count = client_disconnects.clone();
        core.hook_pipeline().register(
            Direction::Local,
            local::CLIENT_DISCONNECTED,
            sync_hook(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(EventAction::Continue)
            }),
        );
    }

    let (client_side, mut client_peer) = memory_link();
    core.accept_client(Box::new(client_side.stream), Arc::new(client_side.sink));

    wait_for_phase(&core, SessionPhase::Idle).await;

    // Only the server-side hook fires; the pending client is cleared, not
    // kicked.
    assert_eq!(server_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(client_disconnects.load(Ordering::SeqCst), 0);

    // The dropped sink closes the client's transport without any packet
    // (in particular, no kick_disconnect) having been written to it.
    match tokio::time::timeout(Duration::from_secs(60), client_peer.stream.next())
        .await
        .unwrap()
    {
        None => {}
        Some(other) => panic!("expected a silently closed transport, got {other:?}"),
    }
}

#[tokio::test]
async fn module_command_reloads_core_in_flight() {
    let (core, mut client_peer, _server_peer) = start_proxy().await;

    client_peer
        .sink
        .write("chat", json!({ "message": "/p:module reload core" }))
        .await
        .unwrap();

    let data = expect_packet(&mut client_peer, "chat").await;
    let component: Value = serde_json::from_str(data["message"].as_str().unwrap()).unwrap();
    assert_eq!(component["text"], json!("Module core reloaded"));
    assert!(core.modules().is_loaded("core"));
}

#[tokio::test]
async fn unknown_proxy_command_is_reported() {
    let (_core, mut client_peer, _server_peer) = start_proxy().await;

    client_peer
        .sink
        .write("chat", json!({ "message": "/p:doesnotexist" }))
        .await
        .unwrap();

    let data = expect_packet(&mut client_peer, "chat").await;
    let component: Value = serde_json::from_str(data["message"].as_str().unwrap()).unwrap();
    assert_eq!(component["translate"], json!("command.unknown.command"));
}
