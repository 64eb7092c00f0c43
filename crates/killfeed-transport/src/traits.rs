//! Transport abstraction traits for Killfeed.
//!
//! A [`Transport`] dials a server and yields a [`Connection`], which splits
//! into a [`FrameSink`] and a [`FrameStream`] so that sending and receiving
//! can run on different tasks.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Take the next connection number.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] killfeed_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The sending half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    ///
    /// Closing an already closed sink is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// The receiving half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Text and binary messages both come back as bytes; control messages
    /// are absorbed. Returns `None` if the connection is closed cleanly.
    ///
    /// Implementations must be cancel safe: the session drives this from a
    /// `select!` alongside its shutdown signal.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// A transport that can open connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the given URL.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// An open connection, not yet split.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<String>,
    sink: Box<dyn FrameSink>,
    stream: Box<dyn FrameStream>,
}

impl Connection {
    /// Create a connection from its two halves.
    #[must_use]
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self {
            id: ConnectionId::next(),
            remote_addr: None,
            sink,
            stream,
        }
    }

    /// Attach the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the remote address of the connection, if available.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Split into the sending and receiving halves.
    #[must_use]
    pub fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (self.sink, self.stream)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.sink.is_open())
            .finish()
    }
}
