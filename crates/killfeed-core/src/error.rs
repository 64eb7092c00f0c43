//! Session errors.

use crate::session::SessionState;
use killfeed_protocol::ProtocolError;
use killfeed_transport::TransportError;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Why joining the channel failed.
#[derive(Debug, Error)]
pub enum JoinFailure {
    /// The server answered the join with a non-`ok` status.
    #[error("join rejected with status {status:?}: {response}")]
    Rejected { status: String, response: Value },

    /// The transport failed before a reply arrived.
    #[error("transport error before join reply: {0}")]
    Transport(TransportError),

    /// The connection closed before a reply arrived.
    #[error("connection closed before join reply")]
    Closed,

    /// No reply arrived in time.
    #[error("no join reply within {0:?}")]
    Timeout(Duration),
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The channel join did not succeed.
    #[error("Connection failure: {0}")]
    ConnectionFailure(#[from] JoinFailure),

    /// A command was issued while the session is not running.
    #[error("Not connected")]
    NotConnected,

    /// The operation is not valid in the current state.
    #[error("Invalid session state: {0}")]
    InvalidState(SessionState),

    /// Transport error while sending.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame encoding error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_messages() {
        let err = SessionError::from(JoinFailure::Rejected {
            status: "error".into(),
            response: json!({"reason": "unauthorized"}),
        });
        assert_eq!(
            err.to_string(),
            r#"Connection failure: join rejected with status "error": {"reason":"unauthorized"}"#
        );

        assert_eq!(SessionError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            SessionError::InvalidState(SessionState::Closed).to_string(),
            "Invalid session state: closed"
        );
    }
}
