//! In-memory transport pair, used by tests and in-process embedding.

use super::{PacketMeta, PacketSink, PacketStream, TransportEvent};
use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// One side of an in-memory link.
pub struct MemoryEndpoint {
    pub stream: MemoryStream,
    pub sink: MemorySink,
}

/// Creates two connected endpoints. Whatever one side's sink writes shows
/// up on the other side's stream.
pub fn memory_link() -> (MemoryEndpoint, MemoryEndpoint) {
    let (to_a, from_b) = mpsc::unbounded_channel();
    let (to_b, from_a) = mpsc::unbounded_channel();
    (
        MemoryEndpoint {
            stream: MemoryStream { rx: from_b },
            sink: MemorySink { tx: to_b },
        },
        MemoryEndpoint {
            stream: MemoryStream { rx: from_a },
            sink: MemorySink { tx: to_a },
        },
    )
}

pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl PacketStream for MemoryStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[derive(Clone)]
pub struct MemorySink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MemorySink {
    /// Delivers an arbitrary transport event to the peer. Test drivers use
    /// this for `State`, `Login` and malformed-shape cases that `write`
    /// cannot produce.
    pub fn send_event(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx.send(event).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl PacketSink for MemorySink {
    async fn write(&self, name: &str, data: Value) -> Result<(), TransportError> {
        self.send_event(TransportEvent::Packet {
            data,
            meta: PacketMeta {
                name: name.to_string(),
                state: "play".to_string(),
            },
        })
    }

    async fn close(&self, reason: Option<String>) -> Result<(), TransportError> {
        // A close races naturally with the peer going away first.
        let _ = self.send_event(TransportEvent::End(reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_cross_the_link() {
        let (a, mut b) = memory_link();
        a.sink.write("chat", json!({"message": "hello"})).await.unwrap();

        match b.stream.next().await {
            Some(TransportEvent::Packet { data, meta }) => {
                assert_eq!(meta.name, "chat");
                assert_eq!(meta.state, "play");
                assert_eq!(data, json!({"message": "hello"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_delivers_end() {
        let (a, mut b) = memory_link();
        a.sink.close(Some("bye".into())).await.unwrap();
        match b.stream.next().await {
            Some(TransportEvent::End(reason)) => assert_eq!(reason.as_deref(), Some("bye")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
