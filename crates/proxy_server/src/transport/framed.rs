//! Length-prefixed JSON frame transport over TCP.
//!
//! A development stand-in for the real game codec (framing, varints,
//! compression and encryption are out of scope here): each frame is a
//! length-delimited JSON object tagged with its kind. The upstream
//! connector and the local listener both speak it, which makes a loopback
//! proxy chain fully exercisable without the game protocol stack.

use super::{PacketMeta, PacketSink, PacketStream, TransportEvent};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Packet {
        name: String,
        state: String,
        data: Value,
    },
    State {
        state: String,
    },
    Login,
    End {
        reason: Option<String>,
    },
}

/// Splits a TCP stream into transport halves.
pub fn split(stream: TcpStream) -> (FramedStream, Arc<FramedSink>) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (sink, stream) = framed.split();
    (
        FramedStream {
            inner: stream,
            ended: false,
        },
        Arc::new(FramedSink {
            inner: tokio::sync::Mutex::new(sink),
        }),
    )
}

pub struct FramedStream {
    inner: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    ended: bool,
}

#[async_trait]
impl PacketStream for FramedStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        if self.ended {
            return None;
        }
        match self.inner.next().await {
            None => {
                self.ended = true;
                Some(TransportEvent::End(None))
            }
            Some(Err(e)) => {
                self.ended = true;
                Some(TransportEvent::Error(e.to_string()))
            }
            Some(Ok(bytes)) => match serde_json::from_slice::<Frame>(&bytes) {
                Ok(Frame::Packet { name, state, data }) => Some(TransportEvent::Packet {
                    data,
                    meta: PacketMeta { name, state },
                }),
                Ok(Frame::State { state }) => Some(TransportEvent::State(state)),
                Ok(Frame::Login) => Some(TransportEvent::Login),
                Ok(Frame::End { reason }) => {
                    self.ended = true;
                    Some(TransportEvent::End(reason))
                }
                Err(e) => {
                    self.ended = true;
                    Some(TransportEvent::Error(format!("undecodable frame: {e}")))
                }
            },
        }
    }
}

pub struct FramedSink {
    inner: tokio::sync::Mutex<SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>>,
}

impl FramedSink {
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(frame)?;
        self.inner
            .lock()
            .await
            .send(Bytes::from(bytes))
            .await
            .map_err(TransportError::Io)
    }

    /// Announces a protocol state switch to the peer.
    pub async fn send_state(&self, state: &str) -> Result<(), TransportError> {
        self.send_frame(&Frame::State {
            state: state.to_string(),
        })
        .await
    }

    /// Announces login completion to the peer.
    pub async fn send_login(&self) -> Result<(), TransportError> {
        self.send_frame(&Frame::Login).await
    }
}

#[async_trait]
impl PacketSink for FramedSink {
    async fn write(&self, name: &str, data: Value) -> Result<(), TransportError> {
        self.send_frame(&Frame::Packet {
            name: name.to_string(),
            state: "play".to_string(),
            data,
        })
        .await
    }

    async fn close(&self, reason: Option<String>) -> Result<(), TransportError> {
        // Best effort: the peer may already be gone.
        let _ = self.send_frame(&Frame::End { reason }).await;
        let mut sink = self.inner.lock().await;
        let _ = sink.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_stream, sink) = split(stream);
            sink.send_login().await.unwrap();
            sink.send_state("play").await.unwrap();
            sink.write("chat", json!({"message": "over tcp"}))
                .await
                .unwrap();
            sink.close(Some("done".into())).await.unwrap();
        });

        let (accepted, _) = listener.accept().await.unwrap();
        let (mut stream, _sink) = split(accepted);

        assert!(matches!(stream.next().await, Some(TransportEvent::Login)));
        match stream.next().await {
            Some(TransportEvent::State(state)) => assert_eq!(state, "play"),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(TransportEvent::Packet { data, meta }) => {
                assert_eq!(meta.name, "chat");
                assert_eq!(data["message"], json!("over tcp"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(TransportEvent::End(reason)) => assert_eq!(reason.as_deref(), Some("done")),
            other => panic!("unexpected event: {other:?}"),
        }

        client.await.unwrap();
    }
}
