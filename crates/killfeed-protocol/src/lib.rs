//! # killfeed-protocol
//!
//! Wire protocol definitions for the Killfeed channel client.
//!
//! The killmail feed speaks a Phoenix-style channel protocol: JSON frames of
//! the shape `{topic, event, payload, ref}` over a persistent connection.
//!
//! ## Events
//!
//! - Outbound: `phx_join`, `phx_leave`, `subscribe_systems`,
//!   `unsubscribe_systems`, `get_status`
//! - Inbound: `phx_reply`, `killmail_update`, `kill_count_update`; anything
//!   else is surfaced as [`InboundEvent::Unrecognized`]
//!
//! ## Example
//!
//! ```rust
//! use killfeed_protocol::{codec, OutboundCommand, Ref, LOBBY_TOPIC};
//!
//! let command = OutboundCommand::subscribe_systems(LOBBY_TOPIC, &[30000142], Ref(2));
//! let encoded = codec::encode(&command).unwrap();
//! let frame = codec::decode(encoded.as_bytes()).unwrap();
//! assert_eq!(frame.event, "subscribe_systems");
//! ```

pub mod codec;
pub mod endpoint;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_event, encode, ProtocolError};
pub use endpoint::Endpoint;
pub use frames::{
    InboundEvent, Killmail, OutboundCommand, OutboundEvent, RawFrame, Ref, ReplyStatus, SystemId,
    Victim,
};
pub use version::{Version, JOIN_REF, LOBBY_TOPIC, PROTOCOL_VERSION, SOCKET_PATH};
