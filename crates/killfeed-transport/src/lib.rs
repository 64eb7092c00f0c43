//! # killfeed-transport
//!
//! Transport abstraction layer for the Killfeed channel client.
//!
//! - **WebSocket** - tokio-tungstenite client, the production transport
//! - **Memory** - in-process pair, the other end driven by a test peer
//!
//! ## Transport Abstraction
//!
//! Every transport yields a [`Connection`] that splits into a [`FrameSink`]
//! and a [`FrameStream`], so the session can receive on its own task while
//! commands are sent from the caller's.
//!
//! ```rust,ignore
//! use killfeed_transport::{Transport, WebSocketTransport};
//!
//! let connection = WebSocketTransport::default().connect(url).await?;
//! let (mut sink, mut stream) = connection.into_split();
//! while let Ok(Some(frame)) = stream.recv().await {
//!     // Process frame
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryListener, MemoryPeer, MemoryTransport};
pub use traits::{Connection, ConnectionId, FrameSink, FrameStream, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
