//! Mesh client error types.

use signaling_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the mesh controller and its collaborators.
///
/// A `Peer` error concerns one remote only; the controller converts it into a
/// terminal state for that peer and keeps serving the others.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Mesh capacity reached ({max_peers} peers)")]
    CapacityExceeded { max_peers: usize },

    #[error("Relay connection closed")]
    Closed,
}
