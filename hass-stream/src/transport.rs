//! Duplex text-frame transports
//!
//! The connection only needs three things from the socket: send a text
//! frame, receive the next text frame, close. [`Transport`] captures exactly
//! that so the state machine can be driven by an in-memory transport in
//! tests and by [`WebSocketTransport`] in production.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, TransportError};

/// A bidirectional stream of text frames
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Receive the next text frame
    ///
    /// Returns `None` once the peer has closed the stream. Implementations
    /// must be cancel safe: the connection polls this inside `select!` and
    /// drops the future whenever an outgoing frame is ready first.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the stream; further calls are no-ops
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// [`Transport`] over `tokio-tungstenite`, with TLS for `wss://` endpoints
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WebSocketTransport {
    /// Dial the endpoint described by `config`, bounded by `connect_timeout`
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let url = config.websocket_url()?;
        tracing::debug!(url = %url, "Opening WebSocket");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (stream, response) = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(config.connect_timeout))?
            .map_err(|e| TransportError::ConnectFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(status = %response.status(), "WebSocket established");
        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::debug!("Ignoring non UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Server closed WebSocket");
                    self.closed = true;
                    return None;
                }
                // tungstenite answers control frames itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
