//! Mailbox message types for the relay actors.

use crate::errors::RelayError;
use crate::models::{MembershipUpdate, Participant};

use super::room::RoomActorHandle;

use common::types::{ConnectionId, RoomCode, UserId};
use serde_json::Value;
use signaling_protocol::{ServerEvent, SignalKind};
use tokio::sync::{mpsc, oneshot};

/// Messages handled by the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Find the live room actor for `room_code`, spawning one when `create` is set.
    Resolve {
        room_code: RoomCode,
        create: bool,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// A room actor emptied and closed its mailbox.
    RoomStopped { room_code: RoomCode, generation: u64 },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Snapshot of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub rooms: usize,
}

/// Messages handled by a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// HTTP join: insert or replace a ledger entry.
    Join {
        user_id: UserId,
        name: Option<String>,
        respond_to: oneshot::Sender<MembershipUpdate>,
    },

    /// HTTP leave: remove the ledger entry and evict the user's routes.
    Leave {
        user_id: UserId,
        respond_to: oneshot::Sender<MembershipUpdate>,
    },

    List {
        respond_to: oneshot::Sender<Vec<Participant>>,
    },

    /// Broadcast `meeting-ended`, snapshot the ledger and stop.
    End {
        respond_to: oneshot::Sender<Vec<Participant>>,
    },

    /// Relay `join-room`: attach a connection's route. `epoch` is echoed in
    /// any `RoomEnded` or `Evicted` sent for this route.
    Announce {
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: Option<String>,
        outbound: mpsc::Sender<ConnectionCommand>,
        epoch: u64,
        respond_to: oneshot::Sender<Result<MembershipUpdate, RelayError>>,
    },

    /// Relay `leave-room` or transport close: detach a connection's route.
    Depart {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<MembershipUpdate>,
    },

    /// Relay `signal`: unicast when `target` is set, otherwise broadcast.
    Signal {
        from: ConnectionId,
        target: Option<ConnectionId>,
        kind: Option<SignalKind>,
        payload: Value,
    },
}

/// Commands queued to a `ConnectionActor` by the room it is announced in.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    /// Write this event to the client.
    Deliver(ServerEvent),

    /// The room ended. The connection writes `meeting-ended` and returns to
    /// `Connected` if its current announcement is still `epoch` in `room_code`.
    RoomEnded { room_code: RoomCode, epoch: u64 },

    /// The connection's user left the room over HTTP; the route announced at
    /// `epoch` is gone.
    Evicted { room_code: RoomCode, epoch: u64 },
}
