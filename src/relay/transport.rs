//! Relay transports.
//!
//! The relay itself is transport-agnostic; it only needs a way to open a
//! framed duplex channel. `WsTransport` is the production implementation
//! (the worker speaks JSON frames over a WebSocket); `ChannelTransport`
//! is an in-memory pair for embedding tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::Frame;
use crate::sandbox::error::SandboxError;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the transport and return the inbound frame stream.
    async fn connect(&self) -> Result<mpsc::Receiver<Frame>, SandboxError>;

    async fn send(&self, frame: Frame) -> Result<(), SandboxError>;

    async fn close(&self);
}

// ── WebSocket transport ─────────────────────────────────────────────

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsTransport {
    url: String,
    sink: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<Frame>, SandboxError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SandboxError::Transport(format!("websocket connect failed: {e}")))?;

        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable relay frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "relay websocket error");
                        break;
                    }
                }
            }
        });
        *self.reader.lock().await = Some(handle);

        Ok(rx)
    }

    async fn send(&self, frame: Frame) -> Result<(), SandboxError> {
        let text = serde_json::to_string(&frame)
            .map_err(|e| SandboxError::Serde(format!("frame encode failed: {e}")))?;
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| SandboxError::Transport(format!("websocket send failed: {e}"))),
            None => Err(SandboxError::Transport("transport not connected".into())),
        }
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }
}

// ── In-memory transport ─────────────────────────────────────────────

/// One side of an in-memory frame channel. The returned sender/receiver
/// pair plays the remote peer.
pub struct ChannelTransport {
    inbound: Mutex<Option<mpsc::Receiver<Frame>>>,
    outbound: mpsc::Sender<Frame>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (peer_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, peer_rx) = mpsc::channel(64);
        (
            Self {
                inbound: Mutex::new(Some(inbound_rx)),
                outbound: outbound_tx,
            },
            peer_tx,
            peer_rx,
        )
    }
}

#[async_trait]
impl RelayTransport for ChannelTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<Frame>, SandboxError> {
        self.inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| SandboxError::Transport("transport already connected".into()))
    }

    async fn send(&self, frame: Frame) -> Result<(), SandboxError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SandboxError::Transport("peer closed".into()))
    }

    async fn close(&self) {}
}
