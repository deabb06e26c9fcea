//! In-process stand-ins for the media stack and the relay uplink.
//!
//! Used by unit tests here and by integration tests that drive a controller
//! against a real relay without a browser.

use crate::errors::MeshError;
use crate::peer::{
    LocalTrack, MediaCapture, PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack,
    SignalSink, TransportState,
};
use async_trait::async_trait;
use common::types::ConnectionId;
use serde_json::{json, Value};
use signaling_protocol::{ClientEvent, SignalKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One call made on a [`MockPeerConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SignalKind),
    AddIceCandidate(Value),
    ReplaceTracks(Vec<String>),
    Close,
}

/// Peer connection that records every call and never touches a network.
pub struct MockPeerConnection {
    remote: ConnectionId,
    events: mpsc::Sender<PeerEvent>,
    calls: Mutex<Vec<PeerCall>>,
    closed: AtomicBool,
    fail_offers: bool,
}

impl MockPeerConnection {
    fn record(&self, call: PeerCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Peer(format!("connection to {} is closed", self.remote)));
        }
        Ok(())
    }

    #[must_use]
    pub fn remote(&self) -> ConnectionId {
        self.remote
    }

    #[must_use]
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Candidates applied so far, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    /// Simulate the media stack reporting a transport state change.
    pub async fn emit_state(&self, state: TransportState) {
        let _ = self
            .events
            .send(PeerEvent::StateChanged {
                remote: self.remote,
                state,
            })
            .await;
    }

    /// Simulate ICE gathering a local candidate.
    pub async fn emit_candidate(&self, candidate: Value) {
        let _ = self
            .events
            .send(PeerEvent::LocalCandidate {
                remote: self.remote,
                candidate,
            })
            .await;
    }

    /// Simulate a remote track arriving.
    pub async fn emit_track(&self, track: RemoteTrack) {
        let _ = self
            .events
            .send(PeerEvent::TrackAdded {
                remote: self.remote,
                track,
            })
            .await;
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<Value, MeshError> {
        self.ensure_open()?;
        self.record(PeerCall::CreateOffer);
        if self.fail_offers {
            return Err(MeshError::Peer("offer creation failed".to_string()));
        }
        Ok(json!({"type": "offer", "sdp": format!("v=0 mock-offer {}", self.remote)}))
    }

    async fn create_answer(&self) -> Result<Value, MeshError> {
        self.ensure_open()?;
        self.record(PeerCall::CreateAnswer);
        Ok(json!({"type": "answer", "sdp": format!("v=0 mock-answer {}", self.remote)}))
    }

    async fn set_remote_description(
        &self,
        kind: SignalKind,
        _description: Value,
    ) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.record(PeerCall::SetRemoteDescription(kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.record(PeerCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        self.ensure_open()?;
        self.record(PeerCall::ReplaceTracks(
            tracks.iter().map(|t| t.id.clone()).collect(),
        ));
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(PeerCall::Close);
        }
    }
}

/// Factory handing out [`MockPeerConnection`]s and keeping a handle to each.
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_offers: bool,
    fail_create: bool,
}

impl MockPeerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection it creates fails `create_offer`.
    #[must_use]
    pub fn failing_offers() -> Self {
        Self {
            fail_offers: true,
            ..Self::default()
        }
    }

    /// `create` itself fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Most recently created connection to `remote`.
    #[must_use]
    pub fn connection(&self, remote: ConnectionId) -> Option<Arc<MockPeerConnection>> {
        self.created()
            .into_iter()
            .rev()
            .find(|conn| conn.remote == remote)
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        remote: ConnectionId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MeshError> {
        if self.fail_create {
            return Err(MeshError::Peer("media stack unavailable".to_string()));
        }

        let connection = Arc::new(MockPeerConnection {
            remote,
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_offers: self.fail_offers,
        });
        if let Ok(mut created) = self.created.lock() {
            created.push(Arc::clone(&connection));
        }
        Ok(connection as Arc<dyn PeerConnection>)
    }
}

/// Uplink that records every event instead of sending it.
#[derive(Default)]
pub struct RecordingSignalSink {
    sent: Mutex<Vec<ClientEvent>>,
    fail: bool,
}

impl RecordingSignalSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails as if the relay connection were gone.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Unicast signals sent to `target`, as `(kind, payload)`.
    #[must_use]
    pub fn signals_to(&self, target: ConnectionId) -> Vec<(Option<SignalKind>, Value)> {
        self.sent()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Signal(request) if request.target_connection_id == Some(target) => {
                    Some((request.kind, request.payload))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalSink for RecordingSignalSink {
    async fn send(&self, event: ClientEvent) -> Result<(), MeshError> {
        if self.fail {
            return Err(MeshError::Closed);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(event);
        }
        Ok(())
    }
}

/// Capture device set with a fixed track list.
pub struct MockCapture {
    tracks: Vec<LocalTrack>,
    stop_calls: AtomicUsize,
}

impl MockCapture {
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            stop_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl MediaCapture for MockCapture {
    fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.clone()
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}
