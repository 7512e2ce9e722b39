//! The transport seam.
//!
//! [`BridgeSession`][crate::session::BridgeSession] never talks to a socket
//! directly.  It asks a [`Connector`] for a [`Link`] and exchanges text frames
//! over it, so tests and demos can substitute the in-process
//! [`LoopbackBroker`][crate::loopback::LoopbackBroker] for a real rosbridge
//! server.
//!
//! - [`WsConnector`] – production connector over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gnc_types::GncError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

/// Opens links to a broker endpoint.
///
/// # Contract
///
/// * `open` – resolves once the transport is usable, or with
///   [`GncError::Transport`] when the broker cannot be reached.  It must not
///   block the caller's thread.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Link>, GncError>;
}

/// One open, bidirectional text-frame connection.
#[async_trait]
pub trait Link: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), GncError>;

    /// Next text frame from the broker.  `None` means the link closed
    /// cleanly; `Some(Err(_))` is a transport failure.
    ///
    /// Must be cancel-safe: the session polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String, GncError>>;

    /// Close the link gracefully.  Errors are swallowed.
    async fn close(&mut self);
}

/// Check that `endpoint` is a usable `ws://` / `wss://` URL.
pub fn validate_endpoint(endpoint: &str) -> Result<(), GncError> {
    let invalid = |reason: &str| GncError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };
    let uri: Uri = endpoint.parse().map_err(|_| invalid("not a valid URL"))?;
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        Some(_) => return Err(invalid("scheme must be ws or wss")),
        None => return Err(invalid("missing scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WebSocket connector
// ---------------------------------------------------------------------------

/// Connects to a rosbridge server over WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Link>, GncError> {
        let (ws, response) = connect_async(endpoint)
            .await
            .map_err(|e| GncError::Transport(format!("connect to {endpoint}: {e}")))?;
        debug!(endpoint, status = %response.status(), "ws handshake complete");
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, text: String) -> Result<(), GncError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, GncError>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Ping/Pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(GncError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
