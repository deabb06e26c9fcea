//! Seams to the browser media API and the relay uplink.

use crate::errors::MeshError;
use async_trait::async_trait;
use common::types::ConnectionId;
use serde_json::Value;
use signaling_protocol::{ClientEvent, SignalKind};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A locally captured track (camera, microphone, screen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A track received from a remote peer. Dropping it releases the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Underlying transport state as reported by the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Failed, disconnected and closed transports are torn down.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

/// Callbacks from a peer connection, delivered on the session's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate to send to `remote`.
    LocalCandidate { remote: ConnectionId, candidate: Value },
    StateChanged {
        remote: ConnectionId,
        state: TransportState,
    },
    TrackAdded {
        remote: ConnectionId,
        track: RemoteTrack,
    },
}

/// One direct connection to one remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<Value, MeshError>;

    /// Create an answer and set it as the local description.
    async fn create_answer(&self) -> Result<Value, MeshError>;

    async fn set_remote_description(&self, kind: SignalKind, description: Value)
        -> Result<(), MeshError>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), MeshError>;

    /// Remove every existing sender and add `tracks`.
    async fn replace_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError>;

    /// Close the connection. Safe to call from any state, more than once.
    fn close(&self);
}

/// Creates peer connections wired to the session's event channel.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: ConnectionId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MeshError>;
}

/// Uplink to the relay.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, event: ClientEvent) -> Result<(), MeshError>;
}

/// Local capture device set (camera + microphone).
pub trait MediaCapture: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Stop capturing. Idempotent.
    fn stop(&self);
}
