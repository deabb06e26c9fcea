//! Meeting lifecycle handlers.
//!
//! - `POST /meet/create` - Create or reuse a meeting record
//! - `POST /meet/join` - Add a user to a room
//! - `POST /meet/leave` - Remove a user from a room
//! - `POST /meet/end` - End a room and delete its record
//! - `GET /meet/{room_code}` - List room members
//!
//! Browsers call join/leave with `keepalive` or `sendBeacon` while a tab is
//! closing, so every membership route is idempotent and answers an unknown
//! room with an empty list rather than an error. Beacons often arrive as
//! `text/plain`, so bodies are parsed from raw bytes regardless of
//! content type, and an unparseable body is a 400 (not axum's 415/422).

use crate::errors::RelayError;
use crate::models::{
    CreateMeetingRequest, CreateMeetingResponse, EndMeetingRequest, EndMeetingResponse,
    MembershipRequest, ParticipantsResponse,
};
use crate::routes::AppState;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use common::types::RoomCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, instrument};

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, RelayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "relay.handlers.meet", error = %e, "Invalid request body");
        RelayError::BadRequest("Invalid request body".to_string())
    })
}

/// Handler for POST /meet/create
///
/// # Response
///
/// - 200 OK: `{ok, record, shareableLink, reused}`
/// - 400 Bad Request: missing `code` or `hostId`
/// - 503 Service Unavailable: meeting store unreachable
#[instrument(skip_all, name = "relay.meet.create")]
pub async fn create_meeting(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CreateMeetingResponse>, RelayError> {
    let request: CreateMeetingRequest = parse_body(&body)?;
    let request = request.validate()?;
    Ok(Json(state.lifecycle.create_or_reuse(request).await?))
}

/// Handler for POST /meet/join
#[instrument(skip_all, name = "relay.meet.join")]
pub async fn join_meeting(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ParticipantsResponse>, RelayError> {
    let request: MembershipRequest = parse_body(&body)?;
    let (room_code, user_id, name) = request.validate()?;
    Ok(Json(state.lifecycle.join(room_code, user_id, name).await?))
}

/// Handler for POST /meet/leave
///
/// Also evicts the user's live relay connections so peers tear down without
/// waiting for the transport to notice.
#[instrument(skip_all, name = "relay.meet.leave")]
pub async fn leave_meeting(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ParticipantsResponse>, RelayError> {
    let request: MembershipRequest = parse_body(&body)?;
    let (room_code, user_id, _) = request.validate()?;
    Ok(Json(state.lifecycle.leave(room_code, user_id).await?))
}

/// Handler for POST /meet/end
#[instrument(skip_all, name = "relay.meet.end")]
pub async fn end_meeting(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<EndMeetingResponse>, RelayError> {
    let request: EndMeetingRequest = parse_body(&body)?;
    let room_code = request.validate()?;
    Ok(Json(state.lifecycle.end(room_code).await?))
}

/// Handler for GET /meet/{room_code}
#[instrument(skip_all, name = "relay.meet.list")]
pub async fn list_participants(
    State(state): State<Arc<AppState>>,
    Path(room_code): Path<String>,
) -> Result<Json<ParticipantsResponse>, RelayError> {
    let room_code = RoomCode::parse(room_code)
        .ok_or_else(|| RelayError::BadRequest("roomCode is required".to_string()))?;
    Ok(Json(state.lifecycle.list(room_code).await?))
}
