//! WebSocket transport.
//!
//! A transport is split into a sender half, a receiver pump, and an inbox
//! channel. The receiver pump forwards every inbound frame into the inbox in
//! arrival order and then closes it, so consumers observe frames strictly
//! before the close. The traits exist so the in-memory [`crate::fake`]
//! transport can stand in for a socket in tests.

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One frame on the wire, binary or text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Vec<u8>),
    Text(String),
}

/// Sending half of a transport.
pub trait Transport: Send {
    fn send(
        &mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving pump of a transport. `run` forwards inbound frames to the inbox
/// until the underlying stream ends.
pub trait TransportReceiver: Send {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// A connected transport, ready to be driven by a connection or session.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub message_rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts").finish_non_exhaustive()
    }
}

/// Rewrite an HTTP(S) base URL into its WS(S) equivalent and append `path`.
pub fn ws_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_owned()
    };
    format!("{base}{path}")
}

/// Open a WebSocket upgrade to `url` with a bearer-token header.
///
/// A 404 on the upgrade response is reported as the distinguished
/// [`Error::ControlUnsupported`]; callers upgrading a non-control endpoint
/// remap it. Every other handshake failure is a transport error.
pub async fn connect(url: &str, token: &str) -> Result<TransportParts> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Transport(format!("invalid upgrade request: {e}")))?;
    let bearer = format!("Bearer {token}")
        .parse()
        .map_err(|_| Error::Transport("bearer token is not a valid header value".to_owned()))?;
    request.headers_mut().insert(header::AUTHORIZATION, bearer);

    let ws = match connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(tungstenite::Error::Http(response)) => {
            if response.status() == StatusCode::NOT_FOUND {
                return Err(Error::ControlUnsupported);
            }
            return Err(Error::Transport(format!(
                "upgrade rejected: HTTP {}",
                response.status()
            )));
        }
        Err(e) => return Err(Error::Transport(e.to_string())),
    };

    let (sink, stream) = ws.split();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    Ok(TransportParts {
        sender: Box::new(WebSocketSender { sink }),
        receiver: Box::new(WebSocketReceiver { stream, message_tx }),
        message_rx,
    })
}

struct WebSocketSender {
    sink: SplitSink<WsStream, Message>,
}

impl Transport for WebSocketSender {
    fn send(
        &mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let frame = match message {
                WireMessage::Binary(bytes) => Message::Binary(bytes),
                WireMessage::Text(text) => Message::Text(text),
            };
            self.sink
                .send(frame)
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        })
    }
}

struct WebSocketReceiver {
    stream: SplitStream<WsStream>,
    message_tx: mpsc::UnboundedSender<WireMessage>,
}

impl TransportReceiver for WebSocketReceiver {
    fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            while let Some(message) = self.stream.next().await {
                let forwarded = match message {
                    Ok(Message::Binary(bytes)) => WireMessage::Binary(bytes),
                    Ok(Message::Text(text)) => WireMessage::Text(text),
                    Ok(Message::Close(_)) => break,
                    // Pings are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => return Err(Error::Transport(e.to_string())),
                };
                if self.message_tx.send(forwarded).is_err() {
                    break;
                }
            }
            Ok(())
        })
    }
}
