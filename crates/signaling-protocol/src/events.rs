//! Relay events in both directions.
//!
//! Client events keep every identifying field optional so that a frame with a
//! missing room code or user id still decodes; the relay then answers with an
//! `error` event instead of dropping the frame without a trace.

use crate::codec::ProtocolError;
use common::types::{ConnectionId, RoomCode, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Negotiation message kind. Carried next to the payload, never inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Label value for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// `join-room` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    #[serde(default, alias = "roomId", skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A validated `join-room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub room_code: RoomCode,
    pub user_id: UserId,
    pub display_name: Option<String>,
}

impl JoinRoom {
    #[must_use]
    pub fn new(room_code: &RoomCode, user_id: &UserId, name: Option<String>) -> Self {
        Self {
            room_code: Some(room_code.to_string()),
            user_id: Some(user_id.to_string()),
            name,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// `ProtocolError::MissingField` when the room code or user id is absent or empty.
    pub fn validate(&self) -> Result<Announcement, ProtocolError> {
        let room_code = self
            .room_code
            .clone()
            .and_then(RoomCode::parse)
            .ok_or(ProtocolError::MissingField("roomCode"))?;
        let user_id = self
            .user_id
            .clone()
            .and_then(UserId::parse)
            .ok_or(ProtocolError::MissingField("userId"))?;

        Ok(Announcement {
            room_code,
            user_id,
            display_name: self.name.clone().filter(|n| !n.is_empty()),
        })
    }
}

/// `leave-room` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom {
    #[serde(default, alias = "roomId", skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl LeaveRoom {
    #[must_use]
    pub fn new(room_code: &RoomCode, user_id: &UserId) -> Self {
        Self {
            room_code: Some(room_code.to_string()),
            user_id: Some(user_id.to_string()),
        }
    }

    /// # Errors
    ///
    /// `ProtocolError::MissingField` when the room code or user id is absent or empty.
    pub fn validate(&self) -> Result<(RoomCode, UserId), ProtocolError> {
        let room_code = self
            .room_code
            .clone()
            .and_then(RoomCode::parse)
            .ok_or(ProtocolError::MissingField("roomCode"))?;
        let user_id = self
            .user_id
            .clone()
            .and_then(UserId::parse)
            .ok_or(ProtocolError::MissingField("userId"))?;
        Ok((room_code, user_id))
    }
}

/// Client `signal` body. `payload` is relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(default, alias = "roomId", skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
    #[serde(default, alias = "to", skip_serializing_if = "Option::is_none")]
    pub target_connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SignalKind>,
    #[serde(default)]
    pub payload: Value,
}

impl SignalRequest {
    /// Unicast to one connection.
    #[must_use]
    pub fn unicast(target: ConnectionId, kind: SignalKind, payload: Value) -> Self {
        Self {
            room_code: None,
            target_connection_id: Some(target),
            kind: Some(kind),
            payload,
        }
    }

    /// Broadcast to the sender's room.
    #[must_use]
    pub fn broadcast(kind: SignalKind, payload: Value) -> Self {
        Self {
            room_code: None,
            target_connection_id: None,
            kind: Some(kind),
            payload,
        }
    }
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    Signal(SignalRequest),
}

impl ClientEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::LeaveRoom(_) => "leave-room",
            ClientEvent::Signal(_) => "signal",
        }
    }
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Another connection announced itself in the room.
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: UserId,
        name: Option<String>,
        connection_id: ConnectionId,
    },

    /// A negotiation message from another connection.
    #[serde(rename_all = "camelCase")]
    Signal {
        from_connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<SignalKind>,
        payload: Value,
    },

    /// A connection left the room (explicitly, by transport close, or by eviction).
    #[serde(rename_all = "camelCase")]
    UserLeft {
        connection_id: ConnectionId,
        user_id: UserId,
    },

    /// The room was ended; every member is considered departed.
    MeetingEnded {},

    /// A client event was rejected. Nothing was changed.
    Error { code: String, message: String },
}

impl ServerEvent {
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::Signal { .. } => "signal",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::MeetingEnded {} => "meeting-ended",
            ServerEvent::Error { .. } => "error",
        }
    }
}
