//! Transport session over a WebSocket.
//!
//! One [`Transport::connect`] call opens exactly one physical connection and
//! yields a sink/stream pair. A successful connect is the "opened" signal;
//! everything afterwards arrives as [`TransportEvent`]s. Binary frames are
//! dropped and logged; they never terminate the connection.
//!
//! The traits exist so the connection layer can be exercised against a
//! scripted in-memory transport in tests.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level failure. Command outcomes are never expressed through
/// this type; it covers the physical link only.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection attempt failed.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// A frame could not be written.
    #[error("failed to send frame: {0}")]
    Send(String),
}

/// Signal translated from a raw transport callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The connection closed, with an optional peer-supplied reason.
    Closed(Option<String>),
}

/// Write half of an established connection.
#[async_trait]
pub trait TransportSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// Close the connection. Idempotent best-effort.
    async fn close(&mut self);
}

/// Read half of an established connection.
#[async_trait]
pub trait TransportStream: Send {
    /// Next transport event, or `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// Factory for physical connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one connection to `endpoint`.
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Create a WebSocket transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        let (stream, _response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsEvents { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsEvents {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WsEvents {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(TransportEvent::Message(text.as_str().to_owned()));
                }
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "dropping binary frame");
                }
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.as_str().to_owned());
                    return Some(TransportEvent::Closed(reason));
                }
                // Ping/pong are handled by tungstenite itself.
                Ok(_) => {}
                Err(e) => {
                    return Some(TransportEvent::Closed(Some(e.to_string())));
                }
            }
        }
    }
}
