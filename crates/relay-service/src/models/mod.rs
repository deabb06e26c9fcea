//! Data models for the relay service.
//!
//! Room membership views, the durable meeting record, and HTTP
//! request/response bodies. All JSON is camelCase.

use crate::errors::RelayError;
use chrono::{DateTime, Utc};
use common::types::{RoomCode, UserId};
use serde::{Deserialize, Serialize};

/// Title given to meetings created without one.
pub const DEFAULT_MEETING_TITLE: &str = "Instant Meeting";

/// Scheduled length of a meeting created without one.
pub const DEFAULT_DURATION_MINUTES: i32 = 60;

/// Advisory participant cap stored on the meeting record.
pub const DEFAULT_MAX_PARTICIPANTS: i32 = 50;

// ============================================================================
// Room membership
// ============================================================================

/// One member of a room as seen from outside the registry.
///
/// The live connection handle is deliberately absent: it is not serializable
/// and is meaningless outside the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Epoch milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

/// Result of a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipUpdate {
    /// Members after the mutation, in insertion order.
    pub members: Vec<Participant>,
    /// Whether a ledger entry was inserted or removed. A replace is not a change.
    pub changed: bool,
}

impl MembershipUpdate {
    /// Result for a room that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }
}

// ============================================================================
// Durable meeting record
// ============================================================================

/// Persisted meeting row. Advisory metadata, never the source of truth for
/// who is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    pub code: RoomCode,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub host_user_id: UserId,
    pub share_url: String,
    pub is_active: bool,
    pub people_in_call: i32,
    pub max_participants: i32,
    pub participant_ids: Vec<UserId>,
    pub scheduled_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a meeting is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMeeting {
    pub code: RoomCode,
    pub title: String,
    pub description: Option<String>,
    pub host_user_id: UserId,
    pub share_url: String,
}

impl MeetingRecord {
    /// Build the initial record: active, host counted and listed.
    #[must_use]
    pub fn initial(new: NewMeeting, now: DateTime<Utc>) -> Self {
        Self {
            participant_ids: vec![new.host_user_id.clone()],
            code: new.code,
            title: new.title,
            description: new.description,
            host_user_id: new.host_user_id,
            share_url: new.share_url,
            is_active: true,
            people_in_call: 1,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            scheduled_time: now,
            duration_minutes: DEFAULT_DURATION_MINUTES,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// HTTP bodies
// ============================================================================

fn required<T>(
    value: Option<&String>,
    parse: impl Fn(String) -> Option<T>,
    message: &str,
) -> Result<T, RelayError> {
    value
        .cloned()
        .and_then(parse)
        .ok_or_else(|| RelayError::BadRequest(message.to_string()))
}

/// Body of `POST /meet/create`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeetingRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "hostUserId")]
    pub host_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMeeting {
    pub code: RoomCode,
    pub host_user_id: UserId,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl CreateMeetingRequest {
    /// # Errors
    ///
    /// `RelayError::BadRequest` when `code` or `hostId` is missing.
    pub fn validate(&self) -> Result<CreateMeeting, RelayError> {
        const MESSAGE: &str = "code and hostId are required";
        Ok(CreateMeeting {
            code: required(self.code.as_ref(), RoomCode::parse, MESSAGE)?,
            host_user_id: required(self.host_id.as_ref(), UserId::parse, MESSAGE)?,
            title: self.title.clone().filter(|t| !t.trim().is_empty()),
            description: self.description.clone().filter(|d| !d.trim().is_empty()),
        })
    }
}

/// Body of `POST /meet/join` and `POST /meet/leave`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    #[serde(default, alias = "roomId")]
    pub room_code: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl MembershipRequest {
    /// # Errors
    ///
    /// `RelayError::BadRequest` when `roomCode` or `userId` is missing.
    pub fn validate(&self) -> Result<(RoomCode, UserId, Option<String>), RelayError> {
        const MESSAGE: &str = "roomCode and userId are required";
        Ok((
            required(self.room_code.as_ref(), RoomCode::parse, MESSAGE)?,
            required(self.user_id.as_ref(), UserId::parse, MESSAGE)?,
            self.name.clone().filter(|n| !n.is_empty()),
        ))
    }
}

/// Body of `POST /meet/end`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndMeetingRequest {
    #[serde(default, alias = "roomId")]
    pub room_code: Option<String>,
}

impl EndMeetingRequest {
    /// # Errors
    ///
    /// `RelayError::BadRequest` when `roomCode` is missing.
    pub fn validate(&self) -> Result<RoomCode, RelayError> {
        required(
            self.room_code.as_ref(),
            RoomCode::parse,
            "roomCode is required",
        )
    }
}

/// Response of `POST /meet/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeetingResponse {
    pub ok: bool,
    pub record: MeetingRecord,
    pub shareable_link: String,
    pub reused: bool,
}

/// Response of join, leave and list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub ok: bool,
    pub room_code: RoomCode,
    pub participants: Vec<Participant>,
}

/// Response of `POST /meet/end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndMeetingResponse {
    pub ok: bool,
    pub room_code: RoomCode,
    pub participants: Vec<Participant>,
    pub deleted: bool,
}
