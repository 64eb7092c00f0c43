//! Codec for encoding and decoding channel frames.
//!
//! Frames are JSON objects carried one per transport message, so there is no
//! length prefix: a transport message is exactly one frame.

use thiserror::Error;

use crate::frames::{InboundEvent, OutboundCommand, RawFrame, Ref};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a command to its JSON text form.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(command: &OutboundCommand) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(command)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, or not shaped
/// like a frame.
pub fn decode(data: &[u8]) -> Result<RawFrame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let frame: RawFrame = serde_json::from_slice(data)?;

    if frame.event.is_empty() {
        return Err(ProtocolError::Invalid("empty event name".into()));
    }

    Ok(frame)
}

/// Decode and classify a frame in one step.
///
/// # Errors
///
/// Returns an error if [`decode`] fails.
pub fn decode_event(data: &[u8], join_ref: Ref) -> Result<InboundEvent, ProtocolError> {
    decode(data).map(|frame| InboundEvent::classify(frame, join_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::OutboundEvent;
    use serde_json::json;

    #[test]
    fn test_encoded_command_parses_back_as_frame() {
        let commands = vec![
            OutboundCommand::join("killmails:lobby", Ref(1)),
            OutboundCommand::subscribe_systems("killmails:lobby", &[30000142, 30002187], Ref(2)),
            OutboundCommand::unsubscribe_systems("killmails:lobby", &[30000142], Ref(3)),
            OutboundCommand::get_status("killmails:lobby", Ref(4)),
            OutboundCommand::leave("killmails:lobby", Ref(5)),
        ];

        for command in commands {
            let encoded = encode(&command).unwrap();
            let frame = decode(encoded.as_bytes()).unwrap();
            assert_eq!(frame.topic, command.topic);
            assert_eq!(frame.event, command.event.as_str());
            assert_eq!(frame.payload, command.payload);
            assert_eq!(frame.reference, Some(command.reference));
        }
    }

    #[test]
    fn test_encode_shape() {
        let encoded = encode(&OutboundCommand::join("killmails:lobby", Ref(1))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"topic": "killmails:lobby", "event": "phx_join", "payload": {}, "ref": 1})
        );
    }

    #[test]
    fn test_decode_not_json() {
        match decode(b"not json at all") {
            Err(ProtocolError::Json(_)) => {}
            other => panic!("Expected Json error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_event() {
        match decode(br#"{"topic":"t","event":"","payload":{}}"#) {
            Err(ProtocolError::Invalid(_)) => {}
            other => panic!("Expected Invalid error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let data = vec![b' '; MAX_FRAME_SIZE + 1];
        match decode(&data) {
            Err(ProtocolError::FrameTooLarge(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_event() {
        let data = br#"{"topic":"killmails:lobby","event":"kill_count_update","payload":{"system_id":30000142,"count":3},"ref":null}"#;
        let event = decode_event(data, Ref(1)).unwrap();
        assert_eq!(
            event,
            InboundEvent::KillCountUpdate {
                system_id: 30000142,
                count: 3
            }
        );
        assert_eq!(OutboundEvent::GetStatus.as_str(), "get_status");
    }
}
