//! Events delivered to session consumers.

use killfeed_protocol::InboundEvent;
use std::fmt;

/// Why a session stopped receiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    Disconnected,
    /// The server closed the connection.
    PeerClosed,
    /// The transport failed.
    TransportError(String),
    /// `connect()` did not reach the joined state.
    JoinFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected => f.write_str("disconnected"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::TransportError(e) => write!(f, "transport error: {e}"),
            CloseReason::JoinFailed(e) => write!(f, "join failed: {e}"),
        }
    }
}

/// Something a consumer can register interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinReply,
    KillmailUpdate,
    KillCountUpdate,
    Reply,
    Unrecognized,
    Closed,
}

impl EventKind {
    /// Short name for logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JoinReply => "join_reply",
            EventKind::KillmailUpdate => "killmail_update",
            EventKind::KillCountUpdate => "kill_count_update",
            EventKind::Reply => "reply",
            EventKind::Unrecognized => "unrecognized",
            EventKind::Closed => "closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A frame from the server.
    Inbound(InboundEvent),
    /// The session stopped. Emitted once per connect attempt, after a failed
    /// join as well as at the end of a joined session, and always last.
    Closed(CloseReason),
}

impl SessionEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Inbound(InboundEvent::JoinReply { .. }) => EventKind::JoinReply,
            SessionEvent::Inbound(InboundEvent::KillmailUpdate { .. }) => EventKind::KillmailUpdate,
            SessionEvent::Inbound(InboundEvent::KillCountUpdate { .. }) => {
                EventKind::KillCountUpdate
            }
            SessionEvent::Inbound(InboundEvent::Reply { .. }) => EventKind::Reply,
            SessionEvent::Inbound(InboundEvent::Unrecognized { .. }) => EventKind::Unrecognized,
            SessionEvent::Closed(_) => EventKind::Closed,
        }
    }

    /// Get the inbound event, if this is one.
    #[must_use]
    pub fn inbound(&self) -> Option<&InboundEvent> {
        match self {
            SessionEvent::Inbound(event) => Some(event),
            SessionEvent::Closed(_) => None,
        }
    }
}

impl From<InboundEvent> for SessionEvent {
    fn from(event: InboundEvent) -> Self {
        SessionEvent::Inbound(event)
    }
}
