//! Session loop tying a controller to a live relay connection.
//!
//! `MeshSession` owns the controller and serializes everything that touches
//! it: relay events, peer events, commands from a [`MeshSessionHandle`] and a
//! periodic sweep of stale early candidates.

use crate::controller::{Flow, LocalIdentity, MeshConfig, PeerMeshController};
use crate::errors::MeshError;
use crate::peer::{LocalTrack, MediaCapture, PeerConnectionFactory, PeerEvent, SignalSink};
use crate::relay_client::RelayClient;
use anyhow::Context;
use signaling_protocol::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PEER_EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;

/// How often stale early candidates are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The handle asked to leave.
    Left,
    /// The cancellation token fired.
    Cancelled,
    /// The relay announced the meeting ended.
    MeetingEnded,
    /// The relay connection went away.
    RelayClosed,
}

enum MeshCommand {
    SetLocalTracks(Vec<LocalTrack>),
    AttachCapture(Arc<dyn MediaCapture>),
    Leave,
}

/// Controls a running [`MeshSession`].
#[derive(Clone)]
pub struct MeshSessionHandle {
    sender: mpsc::Sender<MeshCommand>,
    cancel: CancellationToken,
}

impl MeshSessionHandle {
    async fn send(&self, command: MeshCommand) -> Result<(), MeshError> {
        self.sender.send(command).await.map_err(|_| MeshError::Closed)
    }

    /// Publish a new local track set (camera toggle, device switch).
    ///
    /// # Errors
    ///
    /// `MeshError::Closed` if the session has stopped.
    pub async fn set_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<(), MeshError> {
        self.send(MeshCommand::SetLocalTracks(tracks)).await
    }

    /// # Errors
    ///
    /// `MeshError::Closed` if the session has stopped.
    pub async fn attach_capture(&self, capture: Arc<dyn MediaCapture>) -> Result<(), MeshError> {
        self.send(MeshCommand::AttachCapture(capture)).await
    }

    /// Leave the room and stop the session.
    ///
    /// # Errors
    ///
    /// `MeshError::Closed` if the session has stopped.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.send(MeshCommand::Leave).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Final state of a session.
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub controller: PeerMeshController,
}

pub struct MeshSession {
    controller: PeerMeshController,
    relay: Arc<RelayClient>,
    relay_events: mpsc::Receiver<ServerEvent>,
    peer_events: mpsc::Receiver<PeerEvent>,
    commands: mpsc::Receiver<MeshCommand>,
    cancel: CancellationToken,
}

impl MeshSession {
    /// Connect to the relay at `url` and announce `identity`.
    ///
    /// # Errors
    ///
    /// Fails if the relay cannot be reached or the announcement cannot be sent.
    pub async fn connect(
        url: &str,
        identity: LocalIdentity,
        config: MeshConfig,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> anyhow::Result<(Self, MeshSessionHandle)> {
        Self::connect_with_cancel(url, identity, config, factory, CancellationToken::new()).await
    }

    /// Like [`MeshSession::connect`], with the session's token a child of `parent`.
    ///
    /// # Errors
    ///
    /// Fails if the relay cannot be reached or the announcement cannot be sent.
    pub async fn connect_with_cancel(
        url: &str,
        identity: LocalIdentity,
        config: MeshConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        parent: CancellationToken,
    ) -> anyhow::Result<(Self, MeshSessionHandle)> {
        let (relay, relay_events) = RelayClient::connect(url)
            .await
            .with_context(|| format!("connecting to relay at {url}"))?;
        let relay = Arc::new(relay);

        let (peer_tx, peer_events) = mpsc::channel(PEER_EVENT_CAPACITY);
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = parent.child_token();

        let room_code = identity.room_code.clone();
        let mut controller = PeerMeshController::new(
            identity,
            config,
            factory,
            Arc::clone(&relay) as Arc<dyn SignalSink>,
            peer_tx,
        );
        controller
            .join()
            .await
            .with_context(|| format!("announcing in room {room_code}"))?;

        let handle = MeshSessionHandle {
            sender: command_tx,
            cancel: cancel.clone(),
        };
        Ok((
            Self {
                controller,
                relay,
                relay_events,
                peer_events,
                commands,
                cancel,
            },
            handle,
        ))
    }

    #[must_use]
    pub fn controller(&self) -> &PeerMeshController {
        &self.controller
    }

    /// Drive the controller until left, cancelled, ended or disconnected.
    #[instrument(
        skip_all,
        name = "mesh.session",
        fields(room_code = %self.controller.identity().room_code)
    )]
    pub async fn run(mut self) -> SessionReport {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);

        let outcome = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.leave().await;
                    break SessionOutcome::Cancelled;
                }

                event = self.relay_events.recv() => {
                    let Some(event) = event else {
                        warn!(target: "mesh.session", "Relay connection lost");
                        self.leave().await;
                        break SessionOutcome::RelayClosed;
                    };
                    if self.controller.handle_server_event(event).await == Flow::Ended {
                        break SessionOutcome::MeetingEnded;
                    }
                }

                Some(event) = self.peer_events.recv() => {
                    self.controller.handle_peer_event(event).await;
                }

                Some(command) = self.commands.recv() => match command {
                    MeshCommand::SetLocalTracks(tracks) => {
                        self.controller.set_local_tracks(tracks).await;
                    }
                    MeshCommand::AttachCapture(capture) => {
                        self.controller.attach_capture(capture).await;
                    }
                    MeshCommand::Leave => {
                        self.leave().await;
                        break SessionOutcome::Left;
                    }
                },

                _ = prune.tick() => {
                    self.controller.prune_early_candidates(Instant::now());
                }
            }
        };

        self.relay.close().await;
        info!(target: "mesh.session", outcome = ?outcome, "Session stopped");

        SessionReport {
            outcome,
            controller: self.controller,
        }
    }

    async fn leave(&mut self) {
        if let Err(e) = self.controller.leave().await {
            debug!(target: "mesh.session", error = %e, "Leave not delivered to relay");
        }
    }
}
