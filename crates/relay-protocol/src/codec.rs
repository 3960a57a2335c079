//! Codec for encoding and decoding Relay frames.
//!
//! Frames are UTF-8 JSON text. Inbound frames go through [`decode_inbound`],
//! which is the only place client input is validated.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Envelope, InboundMessage};

/// Maximum inbound frame size (64 KiB).
pub const MAX_INBOUND_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Invalid JSON or a missing/unknown field.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame parsed but failed validation.
    #[error("Invalid frame: {0}")]
    Invalid(&'static str),
}

/// Encode an envelope to a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(ProtocolError::Encode)
}

/// Decode a server envelope. Used by clients and tests.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode and validate a client frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is oversized, not valid JSON, has missing or
/// extra fields, or carries an empty username.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    decode_inbound_with_limit(text, MAX_INBOUND_SIZE)
}

/// Decode and validate a client frame with an explicit size limit.
///
/// # Errors
///
/// See [`decode_inbound`].
pub fn decode_inbound_with_limit(
    text: &str,
    max_size: usize,
) -> Result<InboundMessage, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    // Derived struct visitors also accept arrays; only objects are frames
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::Invalid("frame must be a JSON object"));
    }
    let message = InboundMessage::deserialize(value)?;

    if message.username.trim().is_empty() {
        return Err(ProtocolError::Invalid("username cannot be empty"));
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageData;

    #[test]
    fn test_decode_inbound_valid() {
        let message = decode_inbound(r#"{"username":"alice","text":"hi"}"#).unwrap();
        assert_eq!(message, InboundMessage::new("alice", "hi"));
    }

    #[test]
    fn test_decode_inbound_empty_text_allowed() {
        let message = decode_inbound(r#"{"username":"alice","text":""}"#).unwrap();
        assert_eq!(message.text, "");
    }

    #[test]
    fn test_decode_inbound_missing_text() {
        match decode_inbound(r#"{"username":"alice"}"#) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_inbound_extra_field() {
        match decode_inbound(r#"{"username":"alice","text":"hi","admin":true}"#) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_inbound_not_json() {
        assert!(matches!(
            decode_inbound("hello there"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_inbound_wrong_types() {
        assert!(decode_inbound(r#"{"username":1,"text":"hi"}"#).is_err());
        assert!(decode_inbound(r#"["alice","hi"]"#).is_err());
    }

    #[test]
    fn test_decode_inbound_rejects_non_objects() {
        for text in [r#"["alice","hi"]"#, r#""alice""#, "42", "null"] {
            match decode_inbound(text) {
                Err(ProtocolError::Invalid(_)) => {}
                other => panic!("Expected Invalid error for {}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_decode_inbound_empty_username() {
        match decode_inbound(r#"{"username":"  ","text":"hi"}"#) {
            Err(ProtocolError::Invalid(_)) => {}
            other => panic!("Expected Invalid error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_inbound_too_large() {
        let text = format!(r#"{{"username":"alice","text":"{}"}}"#, "a".repeat(128));
        match decode_inbound_with_limit(&text, 64) {
            Err(ProtocolError::FrameTooLarge { max, .. }) => assert_eq!(max, 64),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_then_decode_live_message() {
        let envelope = Envelope::message(MessageData::new("alice", "hi", "2024-05-01T12:00:00Z"));
        let encoded = encode(&envelope).unwrap();
        assert_eq!(decode(&encoded).unwrap(), envelope);
    }
}
