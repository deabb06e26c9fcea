//! Signaling protocol for the Huddle relay.
//!
//! Every frame on the relay transport is a UTF-8 JSON text frame shaped as
//! `{"event": "<name>", "data": {...}}`. This crate owns the event types for
//! both directions and the text codec; it never interprets the negotiation
//! payloads it carries.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod events;

pub use codec::{
    decode_client_event, decode_server_event, encode_client_event, encode_server_event,
    ProtocolError, MAX_FRAME_BYTES,
};
pub use events::{
    Announcement, ClientEvent, JoinRoom, LeaveRoom, ServerEvent, SignalKind, SignalRequest,
};
