//! Text-frame codec for relay events.

use crate::events::{ClientEvent, ServerEvent};

/// Upper bound on a single text frame. Session descriptions are a few KiB.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error type for codec and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a known event or its body does not match the event
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A required identifying field is absent or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Frame exceeds [`MAX_FRAME_BYTES`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Serialization failed
    #[error("Failed to encode event: {0}")]
    Encode(String),
}

fn check_len(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(())
}

/// Decode a frame received by the relay.
///
/// # Errors
///
/// Returns an error if the frame is oversized or not a valid client event
pub fn decode_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    check_len(text)?;
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a frame sent by the relay.
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_server_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a frame received by a client.
///
/// # Errors
///
/// Returns an error if the frame is oversized or not a valid server event
pub fn decode_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    check_len(text)?;
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a frame sent by a client.
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_client_event(event: &ClientEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}
