//! Full-mesh peer connection controller.
//!
//! One `PeerMeshController` per joined room. It owns one [`PeerSlot`] per
//! remote connection and is driven serially by relay events and peer events,
//! so an existing slot is the only lock needed to keep two negotiations with
//! the same remote from overlapping.
//!
//! # Per-remote state machine
//!
//! ```text
//! (no slot) ──offer sent/received──> Negotiating ──transport up──> Connected
//!                                         │                            │
//!                                         └──────────┬─────────────────┘
//!                                                    v
//!                                                Terminal ──> (no slot)
//! ```
//!
//! Transitions only move forward. A terminal slot is closed and removed in
//! the same step, so the next offer from that remote starts from scratch.

use crate::errors::MeshError;
use crate::peer::{
    LocalTrack, MediaCapture, PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack,
    SignalSink, TransportState,
};
use common::types::{ConnectionId, RoomCode, UserId};
use serde_json::Value;
use signaling_protocol::{
    ClientEvent, JoinRoom, LeaveRoom, ServerEvent, SignalKind, SignalRequest,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default mesh bound: 7 remote peers, rooms of 8.
pub const DEFAULT_MAX_PEERS: usize = 7;

/// How long candidates for a not-yet-known remote are kept.
pub const DEFAULT_CANDIDATE_GRACE: Duration = Duration::from_secs(10);

/// Early candidates kept per unknown remote; the oldest is dropped beyond this.
const MAX_EARLY_CANDIDATES_PER_REMOTE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Upper bound on simultaneous peer connections.
    pub max_peers: usize,
    pub candidate_grace: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            candidate_grace: DEFAULT_CANDIDATE_GRACE,
        }
    }
}

/// Who this controller announces itself as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub room_code: RoomCode,
    pub user_id: UserId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Sent the offer (the side already in the room).
    Initiator,
    /// Answered an inbound offer.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The relay reported the remote gone.
    Departed,
    /// The transport reported failed, disconnected or closed.
    Transport(TransportState),
    NegotiationFailed,
    MeetingEnded,
    /// This side left the room.
    Left,
}

impl TerminalReason {
    /// Whether the remote also leaves the visible roster.
    const fn removes_from_roster(self) -> bool {
        !matches!(self, TerminalReason::NegotiationFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Negotiating { role: NegotiationRole },
    Connected,
    Terminal { reason: TerminalReason },
}

impl NegotiationState {
    const fn rank(self) -> u8 {
        match self {
            NegotiationState::Negotiating { .. } => 0,
            NegotiationState::Connected => 1,
            NegotiationState::Terminal { .. } => 2,
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, next: NegotiationState) -> bool {
        next.rank() > self.rank()
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Terminal { .. })
    }
}

/// A remote participant as shown in the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIdentity {
    /// Unknown when the remote was first seen through an offer.
    pub user_id: Option<UserId>,
    pub name: Option<String>,
}

/// Whether the session should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Ended,
}

struct PeerSlot {
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerSlot {
    fn new(connection: Arc<dyn PeerConnection>, role: NegotiationRole, pending: Vec<Value>) -> Self {
        Self {
            connection,
            state: NegotiationState::Negotiating { role },
            remote_description_set: false,
            pending_candidates: pending,
            remote_tracks: Vec::new(),
        }
    }

    fn advance(&mut self, next: NegotiationState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

struct EarlyCandidate {
    received_at: Instant,
    candidate: Value,
}

/// Signal kind from the payload when the sender did not label it.
fn infer_kind(payload: &Value) -> Option<SignalKind> {
    match payload.get("type").and_then(Value::as_str) {
        Some("offer") => Some(SignalKind::Offer),
        Some("answer") => Some(SignalKind::Answer),
        _ if payload.get("candidate").is_some() => Some(SignalKind::Candidate),
        _ => None,
    }
}

pub struct PeerMeshController {
    identity: LocalIdentity,
    config: MeshConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    sink: Arc<dyn SignalSink>,
    peer_events: mpsc::Sender<PeerEvent>,
    slots: HashMap<ConnectionId, PeerSlot>,
    roster: HashMap<ConnectionId, RemoteIdentity>,
    early_candidates: HashMap<ConnectionId, Vec<EarlyCandidate>>,
    local_tracks: Vec<LocalTrack>,
    capture: Option<Arc<dyn MediaCapture>>,
    left: bool,
}

impl PeerMeshController {
    /// `peer_events` is handed to every connection the factory creates.
    pub fn new(
        identity: LocalIdentity,
        config: MeshConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        sink: Arc<dyn SignalSink>,
        peer_events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            identity,
            config,
            factory,
            sink,
            peer_events,
            slots: HashMap::new(),
            roster: HashMap::new(),
            early_candidates: HashMap::new(),
            local_tracks: Vec::new(),
            capture: None,
            left: false,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    #[must_use]
    pub fn peer_state(&self, remote: &ConnectionId) -> Option<NegotiationState> {
        self.slots.get(remote).map(|slot| slot.state)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn roster(&self) -> &HashMap<ConnectionId, RemoteIdentity> {
        &self.roster
    }

    #[must_use]
    pub fn remote_tracks(&self, remote: &ConnectionId) -> &[RemoteTrack] {
        self.slots
            .get(remote)
            .map(|slot| slot.remote_tracks.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn early_candidate_count(&self, remote: &ConnectionId) -> usize {
        self.early_candidates.get(remote).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn has_left(&self) -> bool {
        self.left
    }

    /// Announce this participant to the relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay uplink is gone.
    pub async fn join(&mut self) -> Result<(), MeshError> {
        self.left = false;
        let event = ClientEvent::JoinRoom(JoinRoom::new(
            &self.identity.room_code,
            &self.identity.user_id,
            self.identity.name.clone(),
        ));
        self.sink.send(event).await?;
        info!(
            target: "mesh.controller",
            room_code = %self.identity.room_code,
            user_id = %self.identity.user_id,
            "Joined room"
        );
        Ok(())
    }

    /// Apply one relay event.
    pub async fn handle_server_event(&mut self, event: ServerEvent) -> Flow {
        match event {
            ServerEvent::UserJoined {
                user_id,
                name,
                connection_id,
            } => {
                let identity = RemoteIdentity {
                    user_id: Some(user_id),
                    name,
                };
                self.on_peer_arrived(connection_id, identity).await;
                Flow::Continue
            }
            ServerEvent::Signal {
                from_connection_id,
                kind,
                payload,
            } => {
                self.on_signal(from_connection_id, kind, payload).await;
                Flow::Continue
            }
            ServerEvent::UserLeft { connection_id, .. } => {
                self.teardown(connection_id, TerminalReason::Departed);
                self.roster.remove(&connection_id);
                self.early_candidates.remove(&connection_id);
                Flow::Continue
            }
            ServerEvent::MeetingEnded {} => {
                info!(
                    target: "mesh.controller",
                    room_code = %self.identity.room_code,
                    peers = self.slots.len(),
                    "Meeting ended"
                );
                self.shutdown(TerminalReason::MeetingEnded);
                if let Err(e) = self.send_leave().await {
                    debug!(target: "mesh.controller", error = %e, "Leave after meeting end not sent");
                }
                Flow::Ended
            }
            ServerEvent::Error { code, message } => {
                warn!(
                    target: "mesh.controller",
                    room_code = %self.identity.room_code,
                    code = %code,
                    message = %message,
                    "Relay rejected an event"
                );
                Flow::Continue
            }
        }
    }

    /// Apply one callback from a peer connection.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { remote, candidate } => {
                if !self.slots.contains_key(&remote) {
                    return;
                }
                if let Err(e) = self.send_signal(remote, SignalKind::Candidate, candidate).await {
                    warn!(target: "mesh.controller", remote = %remote, error = %e, "Failed to send candidate");
                }
            }
            PeerEvent::StateChanged { remote, state } if state.is_terminal() => {
                self.teardown(remote, TerminalReason::Transport(state));
            }
            PeerEvent::StateChanged {
                remote,
                state: TransportState::Connected,
            } => {
                if let Some(slot) = self.slots.get_mut(&remote) {
                    if slot.advance(NegotiationState::Connected) {
                        info!(target: "mesh.controller", remote = %remote, "Peer connected");
                    }
                }
            }
            PeerEvent::StateChanged { .. } => {}
            PeerEvent::TrackAdded { remote, track } => {
                if let Some(slot) = self.slots.get_mut(&remote) {
                    slot.remote_tracks.push(track);
                }
            }
        }
    }

    /// Replace the local track set on every live connection.
    pub async fn set_local_tracks(&mut self, tracks: Vec<LocalTrack>) {
        self.local_tracks = tracks;
        let targets: Vec<(ConnectionId, Arc<dyn PeerConnection>)> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.state.is_terminal())
            .map(|(remote, slot)| (*remote, Arc::clone(&slot.connection)))
            .collect();

        for (remote, connection) in targets {
            if let Err(e) = connection.replace_tracks(&self.local_tracks).await {
                warn!(target: "mesh.controller", remote = %remote, error = %e, "Failed to replace tracks");
            }
        }
        debug!(
            target: "mesh.controller",
            tracks = self.local_tracks.len(),
            peers = self.slots.len(),
            "Local tracks updated"
        );
    }

    /// Take ownership of the local capture and publish its tracks.
    pub async fn attach_capture(&mut self, capture: Arc<dyn MediaCapture>) {
        let tracks = capture.tracks();
        if let Some(previous) = self.capture.replace(capture) {
            previous.stop();
        }
        self.set_local_tracks(tracks).await;
    }

    /// Drop early candidates older than the grace period. Returns how many.
    pub fn prune_early_candidates(&mut self, now: Instant) -> usize {
        let grace = self.config.candidate_grace;
        let mut dropped = 0;
        self.early_candidates.retain(|_, buffered| {
            let before = buffered.len();
            buffered.retain(|c| now.saturating_duration_since(c.received_at) < grace);
            dropped += before - buffered.len();
            !buffered.is_empty()
        });
        if dropped > 0 {
            debug!(target: "mesh.controller", dropped, "Dropped stale early candidates");
        }
        dropped
    }

    /// Stop capture, close every connection and tell the relay.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `leave-room` could not be sent. Local teardown has
    /// happened regardless.
    pub async fn leave(&mut self) -> Result<(), MeshError> {
        if self.left {
            return Ok(());
        }
        self.shutdown(TerminalReason::Left);
        self.send_leave().await
    }

    async fn on_peer_arrived(&mut self, remote: ConnectionId, identity: RemoteIdentity) {
        if self.left {
            return;
        }
        self.roster.insert(remote, identity);

        if self.slots.contains_key(&remote) {
            debug!(target: "mesh.controller", remote = %remote, "Connection already exists");
            return;
        }
        if !self.has_capacity(remote) {
            return;
        }
        let Some(connection) = self.open_slot(remote, NegotiationRole::Initiator).await else {
            return;
        };

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(target: "mesh.controller", remote = %remote, error = %e, "Offer failed");
                self.teardown(remote, TerminalReason::NegotiationFailed);
                return;
            }
        };
        if let Err(e) = self.send_signal(remote, SignalKind::Offer, offer).await {
            warn!(target: "mesh.controller", remote = %remote, error = %e, "Failed to send offer");
            self.teardown(remote, TerminalReason::NegotiationFailed);
        }
    }

    async fn on_signal(&mut self, from: ConnectionId, kind: Option<SignalKind>, payload: Value) {
        if self.left {
            return;
        }
        let Some(kind) = kind.or_else(|| infer_kind(&payload)) else {
            debug!(target: "mesh.controller", remote = %from, "Unclassified signal dropped");
            return;
        };

        match kind {
            SignalKind::Offer => self.on_offer(from, payload).await,
            SignalKind::Answer => self.on_answer(from, payload).await,
            SignalKind::Candidate => self.on_candidate(from, payload).await,
        }
    }

    async fn on_offer(&mut self, from: ConnectionId, description: Value) {
        let connection = if let Some(slot) = self.slots.get(&from) {
            Arc::clone(&slot.connection)
        } else {
            self.roster.entry(from).or_default();
            if !self.has_capacity(from) {
                return;
            }
            match self.open_slot(from, NegotiationRole::Responder).await {
                Some(connection) => connection,
                None => return,
            }
        };

        if let Err(e) = connection
            .set_remote_description(SignalKind::Offer, description)
            .await
        {
            warn!(target: "mesh.controller", remote = %from, error = %e, "Failed to apply offer");
            self.teardown(from, TerminalReason::NegotiationFailed);
            return;
        }
        self.flush_pending_candidates(from).await;

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(target: "mesh.controller", remote = %from, error = %e, "Answer failed");
                self.teardown(from, TerminalReason::NegotiationFailed);
                return;
            }
        };
        if let Err(e) = self.send_signal(from, SignalKind::Answer, answer).await {
            warn!(target: "mesh.controller", remote = %from, error = %e, "Failed to send answer");
            self.teardown(from, TerminalReason::NegotiationFailed);
        }
    }

    async fn on_answer(&mut self, from: ConnectionId, description: Value) {
        let Some(connection) = self.slots.get(&from).map(|s| Arc::clone(&s.connection)) else {
            debug!(target: "mesh.controller", remote = %from, "Answer without connection dropped");
            return;
        };

        if let Err(e) = connection
            .set_remote_description(SignalKind::Answer, description)
            .await
        {
            warn!(target: "mesh.controller", remote = %from, error = %e, "Failed to apply answer");
            self.teardown(from, TerminalReason::NegotiationFailed);
            return;
        }
        self.flush_pending_candidates(from).await;
    }

    async fn on_candidate(&mut self, from: ConnectionId, candidate: Value) {
        let connection = match self.slots.get_mut(&from) {
            Some(slot) if slot.remote_description_set => Arc::clone(&slot.connection),
            Some(slot) => {
                slot.pending_candidates.push(candidate);
                return;
            }
            None => {
                let buffered = self.early_candidates.entry(from).or_default();
                if buffered.len() >= MAX_EARLY_CANDIDATES_PER_REMOTE {
                    buffered.remove(0);
                }
                buffered.push(EarlyCandidate {
                    received_at: Instant::now(),
                    candidate,
                });
                return;
            }
        };

        if let Err(e) = connection.add_ice_candidate(candidate).await {
            debug!(target: "mesh.controller", remote = %from, error = %e, "Candidate rejected");
        }
    }

    fn has_capacity(&self, remote: ConnectionId) -> bool {
        if self.slots.len() < self.config.max_peers {
            return true;
        }
        warn!(
            target: "mesh.controller",
            remote = %remote,
            max_peers = self.config.max_peers,
            "Mesh capacity reached, not connecting"
        );
        false
    }

    /// Create a connection with the current local tracks and register its slot.
    async fn open_slot(
        &mut self,
        remote: ConnectionId,
        role: NegotiationRole,
    ) -> Option<Arc<dyn PeerConnection>> {
        let connection = match self.factory.create(remote, self.peer_events.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(target: "mesh.controller", remote = %remote, error = %e, "Failed to create peer connection");
                return None;
            }
        };

        if !self.local_tracks.is_empty() {
            if let Err(e) = connection.replace_tracks(&self.local_tracks).await {
                warn!(target: "mesh.controller", remote = %remote, error = %e, "Failed to attach local tracks");
                connection.close();
                return None;
            }
        }

        let early: Vec<Value> = self
            .early_candidates
            .remove(&remote)
            .map(|buffered| buffered.into_iter().map(|c| c.candidate).collect())
            .unwrap_or_default();

        debug!(
            target: "mesh.controller",
            remote = %remote,
            role = ?role,
            early_candidates = early.len(),
            "Peer connection opened"
        );
        self.slots.insert(
            remote,
            PeerSlot::new(Arc::clone(&connection), role, early),
        );
        Some(connection)
    }

    async fn flush_pending_candidates(&mut self, remote: ConnectionId) {
        let Some(slot) = self.slots.get_mut(&remote) else {
            return;
        };
        slot.remote_description_set = true;
        let connection = Arc::clone(&slot.connection);
        let pending = std::mem::take(&mut slot.pending_candidates);

        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                debug!(target: "mesh.controller", remote = %remote, error = %e, "Queued candidate rejected");
            }
        }
    }

    /// Close and forget one remote. Returns whether a slot existed.
    fn teardown(&mut self, remote: ConnectionId, reason: TerminalReason) -> bool {
        let Some(mut slot) = self.slots.remove(&remote) else {
            return false;
        };
        slot.advance(NegotiationState::Terminal { reason });
        slot.connection.close();
        if reason.removes_from_roster() {
            self.roster.remove(&remote);
        }

        info!(
            target: "mesh.controller",
            remote = %remote,
            reason = ?reason,
            released_tracks = slot.remote_tracks.len(),
            "Peer torn down"
        );
        true
    }

    fn shutdown(&mut self, reason: TerminalReason) {
        self.left = true;
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        let remotes: Vec<ConnectionId> = self.slots.keys().copied().collect();
        for remote in remotes {
            self.teardown(remote, reason);
        }
        self.roster.clear();
        self.early_candidates.clear();
        self.local_tracks.clear();
    }

    async fn send_leave(&self) -> Result<(), MeshError> {
        let event = ClientEvent::LeaveRoom(LeaveRoom::new(
            &self.identity.room_code,
            &self.identity.user_id,
        ));
        self.sink.send(event).await
    }

    async fn send_signal(
        &self,
        target: ConnectionId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), MeshError> {
        self.sink
            .send(ClientEvent::Signal(SignalRequest::unicast(target, kind, payload)))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::mock::{MockCapture, MockPeerFactory, PeerCall, RecordingSignalSink};
    use crate::peer::MediaKind;
    use serde_json::json;

    struct Harness {
        controller: PeerMeshController,
        factory: Arc<MockPeerFactory>,
        sink: Arc<RecordingSignalSink>,
        _events: mpsc::Receiver<PeerEvent>,
    }

    fn harness_with(config: MeshConfig, factory: MockPeerFactory) -> Harness {
        let factory = Arc::new(factory);
        let sink = Arc::new(RecordingSignalSink::new());
        let (tx, rx) = mpsc::channel(64);
        let identity = LocalIdentity {
            room_code: RoomCode::parse("R1").unwrap(),
            user_id: UserId::parse("me").unwrap(),
            name: Some("Me".to_string()),
        };
        let controller = PeerMeshController::new(
            identity,
            config,
            Arc::clone(&factory) as Arc<dyn PeerConnectionFactory>,
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            tx,
        );
        Harness {
            controller,
            factory,
            sink,
            _events: rx,
        }
    }

    fn harness() -> Harness {
        harness_with(MeshConfig::default(), MockPeerFactory::new())
    }

    fn joined(user: &str, connection_id: ConnectionId) -> ServerEvent {
        ServerEvent::UserJoined {
            user_id: UserId::parse(user).unwrap(),
            name: Some(user.to_uppercase()),
            connection_id,
        }
    }

    fn signal(from: ConnectionId, kind: Option<SignalKind>, payload: Value) -> ServerEvent {
        ServerEvent::Signal {
            from_connection_id: from,
            kind,
            payload,
        }
    }

    fn track(id: &str, kind: MediaKind) -> LocalTrack {
        LocalTrack {
            id: id.to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_arrival_sends_offer_with_local_tracks_attached() {
        let mut h = harness();
        h.controller
            .set_local_tracks(vec![track("cam", MediaKind::Video), track("mic", MediaKind::Audio)])
            .await;
        let remote = ConnectionId::new();

        let flow = h.controller.handle_server_event(joined("bob", remote)).await;

        assert_eq!(flow, Flow::Continue);
        let conn = h.factory.connection(remote).unwrap();
        assert_eq!(
            conn.calls(),
            vec![
                PeerCall::ReplaceTracks(vec!["cam".to_string(), "mic".to_string()]),
                PeerCall::CreateOffer,
            ]
        );
        let signals = h.sink.signals_to(remote);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].0, Some(SignalKind::Offer));
        assert_eq!(signals[0].1["type"], "offer");
        assert_eq!(
            h.controller.peer_state(&remote),
            Some(NegotiationState::Negotiating {
                role: NegotiationRole::Initiator
            })
        );
        assert_eq!(
            h.controller.roster()[&remote].user_id,
            Some(UserId::parse("bob").unwrap())
        );
    }

    #[tokio::test]
    async fn test_repeated_arrival_keeps_single_connection() {
        let mut h = harness();
        let remote = ConnectionId::new();

        h.controller.handle_server_event(joined("bob", remote)).await;
        h.controller.handle_server_event(joined("bob", remote)).await;

        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.sink.signals_to(remote).len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_offer_creates_responder_and_answers() {
        let mut h = harness();
        let remote = ConnectionId::new();

        h.controller
            .handle_server_event(signal(
                remote,
                Some(SignalKind::Offer),
                json!({"type": "offer", "sdp": "v=0"}),
            ))
            .await;

        let conn = h.factory.connection(remote).unwrap();
        assert_eq!(
            conn.calls(),
            vec![
                PeerCall::SetRemoteDescription(SignalKind::Offer),
                PeerCall::CreateAnswer,
            ]
        );
        let signals = h.sink.signals_to(remote);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].0, Some(SignalKind::Answer));
        assert_eq!(
            h.controller.peer_state(&remote),
            Some(NegotiationState::Negotiating {
                role: NegotiationRole::Responder
            })
        );
        // Known only by connection id until a user-joined names it.
        assert_eq!(h.controller.roster()[&remote], RemoteIdentity::default());
    }

    #[tokio::test]
    async fn test_answer_applies_to_existing_connection_only() {
        let mut h = harness();
        let remote = ConnectionId::new();
        let stranger = ConnectionId::new();

        h.controller.handle_server_event(joined("bob", remote)).await;
        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Answer), json!({"type": "answer"})))
            .await;
        h.controller
            .handle_server_event(signal(stranger, Some(SignalKind::Answer), json!({"type": "answer"})))
            .await;

        let conn = h.factory.connection(remote).unwrap();
        assert_eq!(
            conn.calls().last(),
            Some(&PeerCall::SetRemoteDescription(SignalKind::Answer))
        );
        assert!(h.factory.connection(stranger).is_none());
    }

    #[tokio::test]
    async fn test_candidates_wait_for_remote_description() {
        let mut h = harness();
        let remote = ConnectionId::new();
        h.controller.handle_server_event(joined("bob", remote)).await;

        for n in 0..3 {
            h.controller
                .handle_server_event(signal(remote, Some(SignalKind::Candidate), json!({"candidate": n})))
                .await;
        }
        let conn = h.factory.connection(remote).unwrap();
        assert!(conn.applied_candidates().is_empty());

        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Answer), json!({"type": "answer"})))
            .await;
        assert_eq!(
            conn.applied_candidates(),
            vec![json!({"candidate": 0}), json!({"candidate": 1}), json!({"candidate": 2})]
        );

        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Candidate), json!({"candidate": 3})))
            .await;
        assert_eq!(conn.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_applied_after_it() {
        let mut h = harness();
        let remote = ConnectionId::new();

        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Candidate), json!({"candidate": "early"})))
            .await;
        assert_eq!(h.controller.early_candidate_count(&remote), 1);
        assert_eq!(h.factory.created_count(), 0);

        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Offer), json!({"type": "offer"})))
            .await;

        let conn = h.factory.connection(remote).unwrap();
        assert_eq!(
            conn.calls(),
            vec![
                PeerCall::SetRemoteDescription(SignalKind::Offer),
                PeerCall::AddIceCandidate(json!({"candidate": "early"})),
                PeerCall::CreateAnswer,
            ]
        );
        assert_eq!(h.controller.early_candidate_count(&remote), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_dropped_after_grace() {
        let mut h = harness();
        let remote = ConnectionId::new();

        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Candidate), json!({"candidate": "a"})))
            .await;
        tokio::time::advance(Duration::from_secs(5)).await;
        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Candidate), json!({"candidate": "b"})))
            .await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(h.controller.prune_early_candidates(Instant::now()), 1);
        assert_eq!(h.controller.early_candidate_count(&remote), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(h.controller.prune_early_candidates(Instant::now()), 1);
        assert_eq!(h.controller.early_candidate_count(&remote), 0);
    }

    #[tokio::test]
    async fn test_unlabelled_signal_kind_is_inferred_from_payload() {
        let mut h = harness();
        let remote = ConnectionId::new();

        h.controller
            .handle_server_event(signal(remote, None, json!({"type": "offer", "sdp": "v=0"})))
            .await;
        assert!(h.factory.connection(remote).is_some());

        h.controller
            .handle_server_event(signal(remote, None, json!({"candidate": "c1", "sdpMid": "0"})))
            .await;
        let conn = h.factory.connection(remote).unwrap();
        assert_eq!(conn.applied_candidates().len(), 1);

        let before = conn.calls().len();
        h.controller
            .handle_server_event(signal(remote, None, json!({"hello": "world"})))
            .await;
        assert_eq!(conn.calls().len(), before);
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down_only_that_peer() {
        let mut h = harness();
        let bob = ConnectionId::new();
        let carol = ConnectionId::new();
        h.controller.handle_server_event(joined("bob", bob)).await;
        h.controller.handle_server_event(joined("carol", carol)).await;

        h.controller
            .handle_peer_event(PeerEvent::StateChanged {
                remote: bob,
                state: TransportState::Failed,
            })
            .await;

        assert!(h.factory.connection(bob).unwrap().is_closed());
        assert!(h.controller.peer_state(&bob).is_none());
        assert!(!h.controller.roster().contains_key(&bob));

        assert!(!h.factory.connection(carol).unwrap().is_closed());
        assert!(h.controller.peer_state(&carol).is_some());
        assert!(h.controller.roster().contains_key(&carol));
    }

    #[tokio::test]
    async fn test_connected_is_reached_once_and_never_left_backwards() {
        let mut h = harness();
        let remote = ConnectionId::new();
        h.controller.handle_server_event(joined("bob", remote)).await;

        h.controller
            .handle_peer_event(PeerEvent::StateChanged {
                remote,
                state: TransportState::Connected,
            })
            .await;
        h.controller
            .handle_peer_event(PeerEvent::StateChanged {
                remote,
                state: TransportState::Connecting,
            })
            .await;

        assert_eq!(
            h.controller.peer_state(&remote),
            Some(NegotiationState::Connected)
        );

        // A renegotiation offer on a connected peer answers without regressing.
        h.controller
            .handle_server_event(signal(remote, Some(SignalKind::Offer), json!({"type": "offer"})))
            .await;
        assert_eq!(
            h.controller.peer_state(&remote),
            Some(NegotiationState::Connected)
        );
        assert_eq!(h.factory.created_count(), 1);
    }

    #[test]
    fn test_state_transitions_only_move_forward() {
        let negotiating = NegotiationState::Negotiating {
            role: NegotiationRole::Initiator,
        };
        let terminal = NegotiationState::Terminal {
            reason: TerminalReason::Departed,
        };

        assert!(negotiating.can_transition_to(NegotiationState::Connected));
        assert!(negotiating.can_transition_to(terminal));
        assert!(NegotiationState::Connected.can_transition_to(terminal));
        assert!(!NegotiationState::Connected.can_transition_to(negotiating));
        assert!(!terminal.can_transition_to(NegotiationState::Connected));
        assert!(!negotiating.can_transition_to(negotiating));
    }

    #[tokio::test]
    async fn test_track_change_reaches_every_connection() {
        let mut h = harness();
        let remotes: Vec<ConnectionId> = (0..3).map(|_| ConnectionId::new()).collect();
        for (i, remote) in remotes.iter().enumerate() {
            h.controller
                .handle_server_event(joined(&format!("user{i}"), *remote))
                .await;
        }

        h.controller
            .set_local_tracks(vec![track("screen", MediaKind::Video)])
            .await;

        for remote in &remotes {
            let conn = h.factory.connection(*remote).unwrap();
            assert_eq!(
                conn.calls().last(),
                Some(&PeerCall::ReplaceTracks(vec!["screen".to_string()]))
            );
        }
    }

    #[tokio::test]
    async fn test_departure_releases_remote_tracks() {
        let mut h = harness();
        let remote = ConnectionId::new();
        h.controller.handle_server_event(joined("bob", remote)).await;
        h.controller
            .handle_peer_event(PeerEvent::TrackAdded {
                remote,
                track: RemoteTrack {
                    id: "bob-cam".to_string(),
                    kind: MediaKind::Video,
                },
            })
            .await;
        assert_eq!(h.controller.remote_tracks(&remote).len(), 1);

        h.controller
            .handle_server_event(ServerEvent::UserLeft {
                connection_id: remote,
                user_id: UserId::parse("bob").unwrap(),
            })
            .await;

        assert!(h.controller.remote_tracks(&remote).is_empty());
        assert!(h.controller.roster().is_empty());
        assert!(h.factory.connection(remote).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_meeting_end_closes_everything_and_leaves() {
        let mut h = harness();
        let capture = Arc::new(MockCapture::new(vec![track("cam", MediaKind::Video)]));
        h.controller
            .attach_capture(Arc::clone(&capture) as Arc<dyn MediaCapture>)
            .await;
        h.controller.handle_server_event(joined("bob", ConnectionId::new())).await;
        h.controller.handle_server_event(joined("carol", ConnectionId::new())).await;

        let flow = h.controller.handle_server_event(ServerEvent::MeetingEnded {}).await;

        assert_eq!(flow, Flow::Ended);
        assert_eq!(h.controller.peer_count(), 0);
        assert!(h.factory.created().iter().all(|c| c.is_closed()));
        assert_eq!(capture.stop_calls(), 1);
        assert!(matches!(h.sink.sent().last(), Some(ClientEvent::LeaveRoom(_))));

        // Arrivals after the end are ignored.
        h.controller.handle_server_event(joined("dave", ConnectionId::new())).await;
        assert_eq!(h.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let mut h = harness();
        let capture = Arc::new(MockCapture::new(vec![]));
        h.controller
            .attach_capture(Arc::clone(&capture) as Arc<dyn MediaCapture>)
            .await;
        h.controller.join().await.unwrap();
        h.controller.handle_server_event(joined("bob", ConnectionId::new())).await;

        h.controller.leave().await.unwrap();
        h.controller.leave().await.unwrap();

        let leaves = h
            .sink
            .sent()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::LeaveRoom(_)))
            .count();
        assert_eq!(leaves, 1);
        assert_eq!(capture.stop_calls(), 1);
        assert!(h.controller.has_left());
        assert!(h.factory.created()[0].is_closed());
    }

    #[tokio::test]
    async fn test_leave_tears_down_locally_when_relay_is_gone() {
        let factory = Arc::new(MockPeerFactory::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut controller = PeerMeshController::new(
            LocalIdentity {
                room_code: RoomCode::parse("R1").unwrap(),
                user_id: UserId::parse("me").unwrap(),
                name: None,
            },
            MeshConfig::default(),
            Arc::clone(&factory) as Arc<dyn PeerConnectionFactory>,
            Arc::new(RecordingSignalSink::failing()),
            tx,
        );
        controller.handle_server_event(joined("bob", ConnectionId::new())).await;

        assert!(controller.leave().await.is_err());
        assert_eq!(controller.peer_count(), 0);
        assert!(factory.created()[0].is_closed());
    }

    #[tokio::test]
    async fn test_capacity_bound_refuses_extra_peers() {
        let config = MeshConfig {
            max_peers: 1,
            ..MeshConfig::default()
        };
        let mut h = harness_with(config, MockPeerFactory::new());
        let bob = ConnectionId::new();
        let carol = ConnectionId::new();

        h.controller.handle_server_event(joined("bob", bob)).await;
        h.controller.handle_server_event(joined("carol", carol)).await;
        h.controller
            .handle_server_event(signal(carol, Some(SignalKind::Offer), json!({"type": "offer"})))
            .await;

        assert_eq!(h.factory.created_count(), 1);
        assert!(h.controller.peer_state(&carol).is_none());
        assert!(h.sink.signals_to(carol).is_empty());
    }

    #[tokio::test]
    async fn test_failed_offer_frees_the_slot() {
        let mut h = harness_with(MeshConfig::default(), MockPeerFactory::failing_offers());
        let remote = ConnectionId::new();

        h.controller.handle_server_event(joined("bob", remote)).await;

        assert!(h.controller.peer_state(&remote).is_none());
        assert!(h.factory.connection(remote).unwrap().is_closed());
        assert!(h.sink.signals_to(remote).is_empty());
        // Still in the room, just not connected.
        assert!(h.controller.roster().contains_key(&remote));
    }

    #[tokio::test]
    async fn test_local_candidates_are_sent_unicast() {
        let mut h = harness();
        let remote = ConnectionId::new();
        h.controller.handle_server_event(joined("bob", remote)).await;

        h.controller
            .handle_peer_event(PeerEvent::LocalCandidate {
                remote,
                candidate: json!({"candidate": "local-1"}),
            })
            .await;
        h.controller
            .handle_peer_event(PeerEvent::LocalCandidate {
                remote: ConnectionId::new(),
                candidate: json!({"candidate": "orphan"}),
            })
            .await;

        let signals = h.sink.signals_to(remote);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1], (Some(SignalKind::Candidate), json!({"candidate": "local-1"})));
        assert_eq!(h.sink.sent().len(), 2);
    }
}
