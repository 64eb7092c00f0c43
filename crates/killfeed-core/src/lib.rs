//! # killfeed-core
//!
//! Channel session for the Killfeed client.
//!
//! This crate provides the client-side building blocks:
//!
//! - **Session** - Connect, join, send commands and run the receive loop
//! - **Subscriptions** - Optimistic subscription set reconciled by replies
//! - **Dispatch** - Fan events out to consumers by kind
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Session   │────▶│ Dispatcher  │────▶ consumers
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │   Ledger    │
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use killfeed_core::{ChannelSession, EventKind, SessionConfig};
//! use killfeed_protocol::Endpoint;
//! use killfeed_transport::WebSocketTransport;
//! use std::sync::Arc;
//!
//! let endpoint = Endpoint::new("ws://localhost:4004", "my_client")?;
//! let session = ChannelSession::new(
//!     Arc::new(WebSocketTransport::default()),
//!     SessionConfig::new(endpoint),
//! );
//! let mut kills = session.events().subscribe(EventKind::KillmailUpdate);
//!
//! session.connect().await?;
//! session.subscribe_to_topics(&[30000142]).await?;
//! while let Ok(event) = kills.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod dispatch;
pub mod error;
pub mod event;
pub mod session;
pub mod subscriptions;

pub use dispatch::{Dispatcher, DEFAULT_EVENT_CAPACITY};
pub use error::{JoinFailure, SessionError};
pub use event::{CloseReason, EventKind, SessionEvent};
pub use session::{
    ChannelSession, RequestKind, SessionConfig, SessionState, StatusSnapshot, DEFAULT_JOIN_TIMEOUT,
};
pub use subscriptions::{OpKind, SubscriptionLedger, DEFAULT_PENDING_LIMIT};
