//! JSON codec for live connection frames.

use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB). Image messages are sent inline as data URLs,
/// anything larger is rejected rather than buffered.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is valid JSON but not a usable frame.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to its JSON text form.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from raw bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, or an unknown frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let frame: Frame = serde_json::from_slice(data)?;
    validate(&frame)?;
    Ok(frame)
}

/// Decode a frame from a text message.
///
/// # Errors
///
/// Same as [`decode`].
pub fn decode_str(text: &str) -> Result<Frame, ProtocolError> {
    decode(text.as_bytes())
}

fn validate(frame: &Frame) -> Result<(), ProtocolError> {
    match frame {
        Frame::NewMessage(m) if m.id.is_empty() => {
            Err(ProtocolError::Invalid("message without id".into()))
        }
        Frame::Notification(n) if n.id.is_empty() => {
            Err(ProtocolError::Invalid("notification without id".into()))
        }
        _ => match frame.chat_id() {
            Some("") => Err(ProtocolError::Invalid(format!(
                "{} frame without chatId",
                frame.frame_type()
            ))),
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ContentKind, WireMessage};
    use chrono::{TimeZone, Utc};

    fn message(content: String) -> Frame {
        Frame::NewMessage(WireMessage {
            id: "m-1".into(),
            chat_id: "chat".into(),
            sender_id: Some("u-1".into()),
            content,
            kind: ContentKind::Text,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
            status: None,
        })
    }

    #[test]
    fn test_encode_decode() {
        let frame = message("hello".into());
        let encoded = encode(&frame).unwrap();
        assert!(encoded.starts_with(r#"{"type":"new_message","data":{"#));
        assert_eq!(decode_str(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode_str(r#"{"type":"ride_location","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_decode_empty_chat_id() {
        let err = decode_str(r#"{"type":"typing_status","data":{"chatId":"","isTyping":true}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = message("a".repeat(MAX_FRAME_SIZE + 1));

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        let data = vec![b' '; MAX_FRAME_SIZE + 1];
        assert!(matches!(decode(&data), Err(ProtocolError::FrameTooLarge(_))));
    }
}
