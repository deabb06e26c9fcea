//! Client Peer-Mesh Controller.
//!
//! Per-participant logic that keeps one direct peer connection per other
//! member of a room, negotiated through the relay.
//!
//! # Architecture
//!
//! ```text
//! MeshSession ─┬─ RelayClient (WebSocket) ──> ServerEvent ──┐
//!              └─ PeerEvent channel ─────────────────────────┴─> PeerMeshController
//!                                                                 ├─ PeerConnectionFactory
//!                                                                 └─ SignalSink (relay uplink)
//! ```
//!
//! The browser media API sits behind `PeerConnection` and
//! `PeerConnectionFactory`; negotiation payloads are opaque JSON values.
//!
//! # Capacity
//!
//! A full mesh of `n` participants costs `n * (n - 1) / 2` connections and
//! every participant uploads its media `n - 1` times. The controller refuses
//! to hold more than [`MeshConfig::max_peers`] connections (default 7, rooms
//! of 8) instead of degrading silently.

pub mod controller;
pub mod errors;
pub mod mock;
pub mod peer;
pub mod relay_client;
pub mod session;

pub use controller::{
    Flow, LocalIdentity, MeshConfig, NegotiationRole, NegotiationState, PeerMeshController,
    RemoteIdentity, TerminalReason,
};
pub use errors::MeshError;
pub use peer::{
    LocalTrack, MediaCapture, MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent,
    RemoteTrack, SignalSink, TransportState,
};
pub use relay_client::RelayClient;
pub use session::{MeshSession, MeshSessionHandle, SessionOutcome, SessionReport};
