//! Event relay.
//!
//! Multiplexes real-time push events from a sandbox's transport into a
//! publish/subscribe surface, and carries request/response calls over the
//! same channel. Events are a closed tagged type, so subscribers match
//! exhaustively instead of sniffing untyped payloads; RPC is an explicit
//! `call()` returning a result, never a trailing callback.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::sandbox::error::SandboxError;
pub use transport::{ChannelTransport, RelayTransport, WsTransport};

// ── Events ──────────────────────────────────────────────────────────

/// Push events a sandbox transport can deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Connected,
    Disconnected,
    WorkerRegistered { instance_id: String },
    TerminalOutput { terminal_id: String, data: String },
    TerminalExit { terminal_id: String, exit_code: i32 },
    FileChanged { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayEventKind {
    Connected,
    Disconnected,
    WorkerRegistered,
    TerminalOutput,
    TerminalExit,
    FileChanged,
}

impl RelayEvent {
    pub fn kind(&self) -> RelayEventKind {
        match self {
            Self::Connected => RelayEventKind::Connected,
            Self::Disconnected => RelayEventKind::Disconnected,
            Self::WorkerRegistered { .. } => RelayEventKind::WorkerRegistered,
            Self::TerminalOutput { .. } => RelayEventKind::TerminalOutput,
            Self::TerminalExit { .. } => RelayEventKind::TerminalExit,
            Self::FileChanged { .. } => RelayEventKind::FileChanged,
        }
    }
}

// ── Wire frames ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Event {
        payload: RelayEvent,
    },
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

// ── Relay ───────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&RelayEvent) + Send + Sync>;
type HandlerMap = Arc<RwLock<HashMap<RelayEventKind, Vec<Handler>>>>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>>;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EventRelay {
    transport: Arc<dyn RelayTransport>,
    handlers: HandlerMap,
    pending: PendingMap,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Duration,
}

impl EventRelay {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a handler for one event kind. Handlers registered before
    /// `connect()` are live against the transport from the moment it
    /// connects; no re-registration needed across reconnects.
    pub async fn on<F>(&self, kind: RelayEventKind, handler: F)
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Remove every handler for one event kind.
    pub async fn off(&self, kind: RelayEventKind) {
        self.handlers.write().await.remove(&kind);
    }

    pub async fn connect(&self) -> Result<(), SandboxError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inbound = match self.transport.connect().await {
            Ok(inbound) => inbound,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handlers = self.handlers.clone();
        let pending = self.pending.clone();
        let connected = self.connected.clone();
        let handle = tokio::spawn(async move {
            let mut frames = ReceiverStream::new(inbound);
            while let Some(frame) = frames.next().await {
                match frame {
                    Frame::Event { payload } => dispatch(&handlers, &payload).await,
                    Frame::Response { id, result, error } => {
                        let waiter = pending.lock().await.remove(&id);
                        match waiter {
                            Some(tx) => {
                                let outcome = match error {
                                    Some(message) => Err(message),
                                    None => Ok(result.unwrap_or(serde_json::Value::Null)),
                                };
                                let _ = tx.send(outcome);
                            }
                            None => {
                                tracing::debug!(id, "response for unknown or expired call");
                            }
                        }
                    }
                    Frame::Request { id, method, .. } => {
                        tracing::debug!(id, method = %method, "ignoring inbound request frame");
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            tracing::debug!("relay inbound stream closed");
        });
        *self.reader.lock().await = Some(handle);

        dispatch(&self.handlers, &RelayEvent::Connected).await;
        Ok(())
    }

    /// Publish an event to the transport.
    pub async fn emit(&self, event: RelayEvent) -> Result<(), SandboxError> {
        if !self.is_connected() {
            return Err(SandboxError::Transport("relay not connected".into()));
        }
        self.transport.send(Frame::Event { payload: event }).await
    }

    /// Request/response over the transport. Transport-level failures
    /// normalize into the error arm; they never unwind into subscribers.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SandboxError> {
        if !self.is_connected() {
            return Err(SandboxError::Transport("relay not connected".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let sent = self
            .transport
            .send(Frame::Request {
                id,
                method: method.to_string(),
                params,
            })
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SandboxError::Timeout)
            }
            Ok(Err(_)) => Err(SandboxError::Transport("relay connection closed".into())),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(SandboxError::Transport(message)),
        }
    }

    /// Idempotent. Always fires a synthetic `Disconnected` to local
    /// subscribers, even if the transport was never actually connected.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.transport.close().await;
            if let Some(handle) = self.reader.lock().await.take() {
                handle.abort();
            }
        }
        dispatch(&self.handlers, &RelayEvent::Disconnected).await;
    }
}

async fn dispatch(handlers: &HandlerMap, event: &RelayEvent) {
    let handlers = handlers.read().await;
    if let Some(registered) = handlers.get(&event.kind()) {
        for handler in registered {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn relay() -> (Arc<EventRelay>, tokio::sync::mpsc::Sender<Frame>, tokio::sync::mpsc::Receiver<Frame>)
    {
        let (transport, peer_tx, peer_rx) = ChannelTransport::pair();
        let relay = Arc::new(
            EventRelay::new(Arc::new(transport)).with_call_timeout(Duration::from_millis(200)),
        );
        (relay, peer_tx, peer_rx)
    }

    #[test]
    fn event_frames_roundtrip_as_json() {
        let frame = Frame::Event {
            payload: RelayEvent::TerminalOutput {
                terminal_id: "t-1".into(),
                data: "$ ".into(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"kind\":\"event\""));
        assert!(text.contains("\"event\":\"terminal_output\""));

        let parsed: Frame = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            parsed,
            Frame::Event {
                payload: RelayEvent::TerminalOutput { .. }
            }
        ));
    }

    #[tokio::test]
    async fn handlers_registered_before_connect_receive_events() {
        let (relay, peer_tx, _peer_rx) = relay();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();
        relay
            .on(RelayEventKind::FileChanged, move |event| {
                assert!(matches!(event, RelayEvent::FileChanged { .. }));
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        relay.connect().await.unwrap();
        peer_tx
            .send(Frame::Event {
                payload: RelayEvent::FileChanged {
                    path: "/root/workspace/src/main.rs".into(),
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_resolves_with_peer_response() {
        let (relay, peer_tx, mut peer_rx) = relay();
        relay.connect().await.unwrap();

        // Peer answers the first request it sees.
        tokio::spawn(async move {
            if let Some(Frame::Request { id, method, .. }) = peer_rx.recv().await {
                assert_eq!(method, "terminal.list");
                peer_tx
                    .send(Frame::Response {
                        id,
                        result: Some(serde_json::json!(["t-1", "t-2"])),
                        error: None,
                    })
                    .await
                    .unwrap();
            }
        });

        let value = relay
            .call("terminal.list", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(["t-1", "t-2"]));
    }

    #[tokio::test]
    async fn call_normalizes_peer_errors() {
        let (relay, peer_tx, mut peer_rx) = relay();
        relay.connect().await.unwrap();

        tokio::spawn(async move {
            if let Some(Frame::Request { id, .. }) = peer_rx.recv().await {
                peer_tx
                    .send(Frame::Response {
                        id,
                        result: None,
                        error: Some("no such terminal".into()),
                    })
                    .await
                    .unwrap();
            }
        });

        let err = relay
            .call("terminal.attach", serde_json::json!({"terminal_id": "t-9"}))
            .await
            .unwrap_err();
        match err {
            SandboxError::Transport(message) => assert_eq!(message, "no such terminal"),
            other => panic!("expected Transport, got {other}"),
        }
    }

    #[tokio::test]
    async fn call_times_out_when_peer_stays_silent() {
        let (relay, _peer_tx, _peer_rx) = relay();
        relay.connect().await.unwrap();
        let err = relay
            .call("terminal.list", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout));
    }

    #[tokio::test]
    async fn emit_before_connect_is_rejected() {
        let (relay, _peer_tx, _peer_rx) = relay();
        let err = relay.emit(RelayEvent::Connected).await.unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_fires_synthetic_event() {
        let (relay, _peer_tx, _peer_rx) = relay();

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        relay
            .on(RelayEventKind::Disconnected, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // Never connected: still fires locally, twice for two calls.
        relay.disconnect().await;
        relay.disconnect().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn off_removes_handlers() {
        let (relay, peer_tx, _peer_rx) = relay();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        relay
            .on(RelayEventKind::Connected, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        relay.off(RelayEventKind::Connected).await;

        relay.connect().await.unwrap();
        peer_tx
            .send(Frame::Event {
                payload: RelayEvent::Connected,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
