//! In-process broker for headless tests and demos.
//!
//! [`LoopbackBroker`] implements [`Connector`] without any socket.  The test
//! side of the broker can inspect every frame the session sends, inject
//! inbound frames, answer service calls, and fail or close the link, so the
//! whole bridge stack runs in CI without a rosbridge server.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use gnc_bridge::{BridgeSession, LoopbackBroker};
//! use gnc_types::ConnectionEvent;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = LoopbackBroker::new();
//! let session = BridgeSession::with_connector("ws://loopback:9090", Arc::new(broker.clone()));
//! let mut events = session.events();
//! session.connect().expect("endpoint is valid");
//! assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
//! # }
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use gnc_types::GncError;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::session::lock;
use crate::transport::{Connector, Link};

enum LinkInput {
    Frame(String),
    Fail(String),
    Close,
}

struct BrokerShared {
    refusing: AtomicBool,
    opens: AtomicUsize,
    graceful_closes: AtomicUsize,
    current: Mutex<Option<mpsc::UnboundedSender<LinkInput>>>,
    frames_tx: mpsc::UnboundedSender<Value>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

/// Scriptable stand-in for a rosbridge server.  Clones share state.
#[derive(Clone)]
pub struct LoopbackBroker {
    shared: Arc<BrokerShared>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(BrokerShared {
                refusing: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                graceful_closes: AtomicUsize::new(0),
                current: Mutex::new(None),
                frames_tx,
                frames_rx: tokio::sync::Mutex::new(frames_rx),
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `open` attempts seen, refused ones included.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of links the session closed gracefully.
    pub fn graceful_close_count(&self) -> usize {
        self.shared.graceful_closes.load(Ordering::SeqCst)
    }

    /// Wait for the next frame the session sent, decoded as JSON.
    pub async fn next_frame(&self) -> Option<Value> {
        self.shared.frames_rx.lock().await.recv().await
    }

    /// Wait for the next frame whose `op` equals `op`, skipping others.
    pub async fn next_frame_with_op(&self, op: &str) -> Option<Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame["op"] == op {
                return Some(frame);
            }
        }
    }

    /// Drain the frames sent so far without waiting.
    pub async fn drain_frames(&self) -> Vec<Value> {
        let mut rx = self.shared.frames_rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Push a raw text frame to the connected session.  Returns `false` when
    /// no link is open.
    pub fn inject(&self, text: impl Into<String>) -> bool {
        self.push(LinkInput::Frame(text.into()))
    }

    /// Deliver a `publish` op on `topic`.
    pub fn publish(&self, topic: &str, msg: Value) -> bool {
        self.inject(json!({ "op": "publish", "topic": topic, "msg": msg }).to_string())
    }

    /// Answer the service call with correlation `id`.
    pub fn respond(&self, id: &str, service: &str, values: Value, result: bool) -> bool {
        self.inject(
            json!({
                "op": "service_response",
                "id": id,
                "service": service,
                "values": values,
                "result": result,
            })
            .to_string(),
        )
    }

    /// Wait for the next `call_service` frame and answer it.  Returns the
    /// request frame.
    pub async fn answer_next_call(&self, values: Value, result: bool) -> Option<Value> {
        let request = self.next_frame_with_op("call_service").await?;
        let id = request["id"].as_str().unwrap_or_default().to_string();
        let service = request["service"].as_str().unwrap_or_default().to_string();
        self.respond(&id, &service, values, result);
        Some(request)
    }

    /// Close the current link from the broker side.
    pub fn drop_link(&self) -> bool {
        let sent = self.push(LinkInput::Close);
        lock(&self.shared.current).take();
        sent
    }

    /// Fail the current link with a transport error.
    pub fn fail_link(&self, reason: impl Into<String>) -> bool {
        let sent = self.push(LinkInput::Fail(reason.into()));
        lock(&self.shared.current).take();
        sent
    }

    fn push(&self, input: LinkInput) -> bool {
        lock(&self.shared.current)
            .as_ref()
            .is_some_and(|tx| tx.send(input).is_ok())
    }
}

#[async_trait]
impl Connector for LoopbackBroker {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Link>, GncError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(GncError::Transport(format!("connection refused: {endpoint}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.current) = Some(tx);
        Ok(Box::new(LoopbackLink {
            inbound: rx,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct LoopbackLink {
    inbound: mpsc::UnboundedReceiver<LinkInput>,
    shared: Arc<BrokerShared>,
    closed: bool,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn send(&mut self, text: String) -> Result<(), GncError> {
        if self.closed {
            return Err(GncError::TransportClosed);
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| GncError::Serialization(e.to_string()))?;
        self.shared
            .frames_tx
            .send(value)
            .map_err(|_| GncError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, GncError>> {
        match self.inbound.recv().await {
            Some(LinkInput::Frame(text)) => Some(Ok(text)),
            Some(LinkInput::Fail(reason)) => Some(Err(GncError::Transport(reason))),
            Some(LinkInput::Close) | None => None,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.graceful_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
