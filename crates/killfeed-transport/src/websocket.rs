//! WebSocket transport implementation.
//!
//! This module provides a client WebSocket transport using tokio-tungstenite.
//! `wss://` endpoints need the `tls` feature.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Connection, FrameSink, FrameStream, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for the TCP connect and WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Get the transport configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        debug!(url = %url, "Opening WebSocket connection");

        let (ws_stream, response) =
            match tokio::time::timeout(self.config.connect_timeout, connect_async(url)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    error!(url = %url, error = %e, "WebSocket handshake failed");
                    return Err(TransportError::ConnectFailed(e.to_string()));
                }
                Err(_) => {
                    warn!(url = %url, timeout = ?self.config.connect_timeout, "WebSocket connect timed out");
                    return Err(TransportError::Timeout);
                }
            };

        let remote = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok().map(|a| a.to_string()),
            _ => None,
        };

        info!(url = %url, status = %response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        let is_open = Arc::new(AtomicBool::new(true));

        let sink = WebSocketSink {
            sink,
            is_open: Arc::clone(&is_open),
        };
        let stream = WebSocketFrameStream {
            stream,
            is_open,
            max_message_size: self.config.max_message_size,
        };

        let connection = Connection::new(Box::new(sink), Box::new(stream));
        Ok(match remote {
            Some(addr) => connection.with_remote_addr(addr),
            None => connection,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Sending half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Receiving half of a WebSocket connection.
pub struct WebSocketFrameStream {
    stream: SplitStream<WsStream>,
    is_open: Arc<AtomicBool>,
    max_message_size: usize,
}

impl WebSocketFrameStream {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(
                killfeed_protocol::ProtocolError::FrameTooLarge(len),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WebSocketFrameStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // tungstenite queues the pong itself
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!("Connection closed");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }
}
