//! In-process transport.
//!
//! [`MemoryTransport`] hands out connections whose other end is a
//! [`MemoryPeer`] obtained from the paired [`MemoryListener`]. The peer plays
//! the server: it reads what the client sent and pushes frames, closes or
//! errors back. Used by tests.

use async_trait::async_trait;
use bytes::Bytes;
use killfeed_protocol::{codec, RawFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connection, FrameSink, FrameStream, Transport, TransportError};

enum ToClient {
    Frame(Bytes),
    Close,
    Error(String),
}

enum ToPeer {
    Frame(String),
    Close,
}

/// Transport whose connections end in a [`MemoryPeer`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the server side of every connection made through the paired
/// [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    /// Create a transport and its listener.
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: tx }, MemoryListener { peers: rx })
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    ///
    /// Returns `None` once every [`MemoryTransport`] clone is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let is_open = Arc::new(AtomicBool::new(true));

        let peer = MemoryPeer {
            url: url.to_string(),
            outbound: to_client_tx,
            inbound: to_peer_rx,
            is_open: Arc::clone(&is_open),
            client_closed: false,
        };

        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("memory listener dropped".into()))?;

        debug!(url = %url, "Memory connection opened");

        let sink = MemorySink {
            tx: to_peer_tx,
            is_open: Arc::clone(&is_open),
        };
        let stream = MemoryStream {
            rx: to_client_rx,
            is_open,
        };

        Ok(Connection::new(Box::new(sink), Box::new(stream)).with_remote_addr(url))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<ToPeer>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(ToPeer::Frame(text))
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(ToPeer::Close)
            .map_err(|_| TransportError::Other("peer dropped".into()))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<ToClient>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.rx.recv().await {
            Some(ToClient::Frame(data)) => Ok(Some(data)),
            Some(ToClient::Error(message)) => {
                self.is_open.store(false, Ordering::SeqCst);
                Err(TransportError::ReceiveFailed(message))
            }
            Some(ToClient::Close) | None => {
                self.is_open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    outbound: mpsc::UnboundedSender<ToClient>,
    inbound: mpsc::UnboundedReceiver<ToPeer>,
    is_open: Arc<AtomicBool>,
    client_closed: bool,
}

impl MemoryPeer {
    /// URL the client connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive the next text frame the client sent.
    ///
    /// Returns `None` once the client closed or dropped its sink.
    pub async fn recv(&mut self) -> Option<String> {
        if self.client_closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(ToPeer::Frame(text)) => Some(text),
            Some(ToPeer::Close) | None => {
                self.client_closed = true;
                None
            }
        }
    }

    /// Receive and decode the next client frame.
    ///
    /// Frames that fail to decode are returned as `None` as well.
    pub async fn recv_frame(&mut self) -> Option<RawFrame> {
        let text = self.recv().await?;
        codec::decode(text.as_bytes()).ok()
    }

    /// Take a frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        match self.inbound.try_recv() {
            Ok(ToPeer::Frame(text)) => Some(text),
            Ok(ToPeer::Close) => {
                self.client_closed = true;
                None
            }
            Err(_) => None,
        }
    }

    /// Push a text frame to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(ToClient::Frame(Bytes::from(text.into())))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        self.is_open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(ToClient::Close);
    }

    /// Make the client's next receive fail with a transport error.
    pub fn fail(&self, message: impl Into<String>) {
        self.is_open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(ToClient::Error(message.into()));
    }

    /// Check if the client closed its side.
    #[must_use]
    pub fn client_closed(&self) -> bool {
        self.client_closed
    }
}
