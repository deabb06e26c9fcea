//! `RoomActor` - single writer for one room's membership and routing.
//!
//! Each live room has exactly one `RoomActor`. It owns two views of the room:
//!
//! - the **ledger**: insertion-ordered participants, unique by user id. HTTP
//!   joins and relay announcements both land here.
//! - the **routing table**: live relay connections by connection id. Signals
//!   are addressed by connection id only.
//!
//! Every routed user has a ledger entry, and a ledger entry points at the
//! newest connection of its user. The actor never awaits a connection: events
//! are queued with `try_send`, so one slow browser cannot stall the room.
//!
//! The actor stops itself once the ledger and the routing table are both
//! empty, or after `end`. It closes its mailbox before telling the registry,
//! so any request that raced with the stop observes `RoomStopped` and can be
//! retried against a fresh room.

use crate::errors::RelayError;
use crate::models::{MembershipUpdate, Participant};
use crate::observability::metrics as prom;

use super::messages::{ConnectionCommand, RegistryMessage, RoomMessage};
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, RoomCode, UserId};
use serde_json::Value;
use signaling_protocol::{ServerEvent, SignalKind};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Default channel buffer size for a room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// The room actor has stopped (emptied, ended or cancelled).
///
/// A stopped room is indistinguishable from an absent one; callers re-resolve
/// through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("room actor stopped")]
pub struct RoomStopped;

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_code: RoomCode,
    generation: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Registry-assigned incarnation number of this room.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the actor has closed its mailbox.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, RoomStopped> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| RoomStopped)?;
        rx.await.map_err(|_| RoomStopped)
    }

    /// Insert or replace the ledger entry of `user_id`.
    pub async fn join(
        &self,
        user_id: UserId,
        name: Option<String>,
    ) -> Result<MembershipUpdate, RoomStopped> {
        self.request(|respond_to| RoomMessage::Join {
            user_id,
            name,
            respond_to,
        })
        .await
    }

    /// Remove `user_id` from the ledger and evict its routes.
    pub async fn leave(&self, user_id: UserId) -> Result<MembershipUpdate, RoomStopped> {
        self.request(|respond_to| RoomMessage::Leave {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Participant>, RoomStopped> {
        self.request(|respond_to| RoomMessage::List { respond_to })
            .await
    }

    /// End the room. Returns the ledger as it was before the end.
    pub async fn end(&self) -> Result<Vec<Participant>, RoomStopped> {
        self.request(|respond_to| RoomMessage::End { respond_to })
            .await
    }

    /// Attach a relay connection to the room.
    pub async fn announce(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: Option<String>,
        outbound: mpsc::Sender<ConnectionCommand>,
        epoch: u64,
    ) -> Result<Result<MembershipUpdate, RelayError>, RoomStopped> {
        self.request(|respond_to| RoomMessage::Announce {
            connection_id,
            user_id,
            display_name,
            outbound,
            epoch,
            respond_to,
        })
        .await
    }

    /// Detach a relay connection from the room.
    pub async fn depart(
        &self,
        connection_id: ConnectionId,
    ) -> Result<MembershipUpdate, RoomStopped> {
        self.request(|respond_to| RoomMessage::Depart {
            connection_id,
            respond_to,
        })
        .await
    }

    /// Queue a signal for routing. No acknowledgement: delivery is best-effort.
    pub async fn signal(
        &self,
        from: ConnectionId,
        target: Option<ConnectionId>,
        kind: Option<SignalKind>,
        payload: Value,
    ) -> Result<(), RoomStopped> {
        self.sender
            .send(RoomMessage::Signal {
                from,
                target,
                kind,
                payload,
            })
            .await
            .map_err(|_| RoomStopped)
    }
}

/// One ledger row.
#[derive(Debug, Clone)]
struct LedgerEntry {
    user_id: UserId,
    name: Option<String>,
    joined_at: DateTime<Utc>,
    connection: Option<ConnectionId>,
}

impl LedgerEntry {
    fn to_participant(&self) -> Participant {
        Participant {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// One routing table row.
#[derive(Debug)]
struct Route {
    user_id: UserId,
    outbound: mpsc::Sender<ConnectionCommand>,
    /// Announcement of the owning connection this route belongs to.
    epoch: u64,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_code: RoomCode,
    generation: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    registry: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    max_participants: usize,
    ledger: Vec<LedgerEntry>,
    routes: HashMap<ConnectionId, Route>,
    ended: bool,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor.
    ///
    /// # Arguments
    ///
    /// * `generation` - Echoed back in `RoomStopped` so the registry can ignore
    ///   notifications from a previous incarnation of the same room code
    /// * `registry` - Registry mailbox for the stop notification
    /// * `max_participants` - Mesh capacity enforced on `announce`
    pub fn spawn(
        room_code: RoomCode,
        generation: u64,
        registry: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
        max_participants: usize,
        metrics: Arc<RelayMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, room_code.as_str()),
            room_code: room_code.clone(),
            generation,
            receiver,
            registry,
            cancel_token: cancel_token.clone(),
            max_participants,
            ledger: Vec::new(),
            routes: HashMap::new(),
            ended: false,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_code,
            generation,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "relay.actor.room", fields(room_code = %self.room_code))]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            generation = self.generation,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.room",
                        room_code = %self.room_code,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else { break };
                    self.mailbox.record_processed(self.receiver.len());
                    self.handle_message(message);

                    if self.ended || (self.ledger.is_empty() && self.routes.is_empty()) {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// Close the mailbox, discard what is queued and notify the registry.
    async fn stop(mut self) {
        self.receiver.close();
        let mut discarded = 0usize;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }

        self.metrics.participants_changed(self.ledger.len(), 0);

        info!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            ended = self.ended,
            discarded = discarded,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );

        let _ = self
            .registry
            .send(RegistryMessage::RoomStopped {
                room_code: self.room_code.clone(),
                generation: self.generation,
            })
            .await;
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                user_id,
                name,
                respond_to,
            } => {
                let _ = respond_to.send(self.join(user_id, name));
            }

            RoomMessage::Leave {
                user_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.leave(&user_id));
            }

            RoomMessage::List { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::End { respond_to } => {
                let _ = respond_to.send(self.end());
            }

            RoomMessage::Announce {
                connection_id,
                user_id,
                display_name,
                outbound,
                epoch,
                respond_to,
            } => {
                let result =
                    self.announce(connection_id, user_id, display_name, outbound, epoch);
                let _ = respond_to.send(result);
            }

            RoomMessage::Depart {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.depart(connection_id));
            }

            RoomMessage::Signal {
                from,
                target,
                kind,
                payload,
            } => {
                self.signal(from, target, kind, payload);
            }
        }
    }

    fn snapshot(&self) -> Vec<Participant> {
        self.ledger.iter().map(LedgerEntry::to_participant).collect()
    }

    fn update(&self, before: usize) -> MembershipUpdate {
        let after = self.ledger.len();
        if before != after {
            self.metrics.participants_changed(before, after);
        }
        MembershipUpdate {
            members: self.snapshot(),
            changed: before != after,
        }
    }

    fn join(&mut self, user_id: UserId, name: Option<String>) -> MembershipUpdate {
        let before = self.ledger.len();
        let now = Utc::now();

        if let Some(entry) = self.ledger.iter_mut().find(|e| e.user_id == user_id) {
            if name.is_some() {
                entry.name = name;
            }
            entry.joined_at = now;
        } else {
            self.ledger.push(LedgerEntry {
                user_id: user_id.clone(),
                name,
                joined_at: now,
                connection: None,
            });
        }

        prom::record_membership_event("join");
        debug!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            user_id = %user_id,
            members = self.ledger.len(),
            "Participant joined"
        );

        self.update(before)
    }

    fn leave(&mut self, user_id: &UserId) -> MembershipUpdate {
        let before = self.ledger.len();
        let Some(position) = self.ledger.iter().position(|e| &e.user_id == user_id) else {
            return self.update(before);
        };
        self.ledger.remove(position);

        let evicted: Vec<ConnectionId> = self
            .routes
            .iter()
            .filter(|(_, route)| &route.user_id == user_id)
            .map(|(connection_id, _)| *connection_id)
            .collect();

        for connection_id in evicted {
            if let Some(route) = self.routes.remove(&connection_id) {
                self.push(
                    connection_id,
                    &route,
                    ConnectionCommand::Evicted {
                        room_code: self.room_code.clone(),
                        epoch: route.epoch,
                    },
                );
                prom::record_membership_event("evict");
                self.broadcast(
                    &ServerEvent::UserLeft {
                        connection_id,
                        user_id: user_id.clone(),
                    },
                    None,
                );
            }
        }

        prom::record_membership_event("leave");
        debug!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            user_id = %user_id,
            members = self.ledger.len(),
            "Participant left"
        );

        self.update(before)
    }

    fn end(&mut self) -> Vec<Participant> {
        let former = self.snapshot();

        for (connection_id, route) in &self.routes {
            self.push(
                *connection_id,
                route,
                ConnectionCommand::RoomEnded {
                    room_code: self.room_code.clone(),
                    epoch: route.epoch,
                },
            );
        }
        self.routes.clear();
        self.ended = true;

        prom::record_membership_event("end");
        info!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            former_members = former.len(),
            "Room ended"
        );

        former
    }

    fn announce(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: Option<String>,
        outbound: mpsc::Sender<ConnectionCommand>,
        epoch: u64,
    ) -> Result<MembershipUpdate, RelayError> {
        let before = self.ledger.len();

        match self.routes.get_mut(&connection_id) {
            Some(route) if route.user_id == user_id => {
                route.epoch = epoch;
                trace!(
                    target: "relay.actor.room",
                    room_code = %self.room_code,
                    connection_id = %connection_id,
                    "Repeated announcement ignored"
                );
                return Ok(self.update(before));
            }
            Some(_) => {
                self.depart(connection_id);
            }
            None => {}
        }

        let before = self.ledger.len();
        let known = self.ledger.iter().any(|e| e.user_id == user_id);
        if !known && self.ledger.len() >= self.max_participants {
            warn!(
                target: "relay.actor.room",
                room_code = %self.room_code,
                connection_id = %connection_id,
                capacity = self.max_participants,
                "Announcement refused, room at mesh capacity"
            );
            return Err(RelayError::RoomFull {
                capacity: self.max_participants,
            });
        }

        if let Some(entry) = self.ledger.iter_mut().find(|e| e.user_id == user_id) {
            entry.connection = Some(connection_id);
            if display_name.is_some() {
                entry.name.clone_from(&display_name);
            }
        } else {
            self.ledger.push(LedgerEntry {
                user_id: user_id.clone(),
                name: display_name.clone(),
                joined_at: Utc::now(),
                connection: Some(connection_id),
            });
        }

        self.broadcast(
            &ServerEvent::UserJoined {
                user_id: user_id.clone(),
                name: display_name,
                connection_id,
            },
            None,
        );
        self.routes.insert(
            connection_id,
            Route {
                user_id,
                outbound,
                epoch,
            },
        );

        prom::record_membership_event("announce");
        debug!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            connection_id = %connection_id,
            routes = self.routes.len(),
            "Connection announced"
        );

        Ok(self.update(before))
    }

    fn depart(&mut self, connection_id: ConnectionId) -> MembershipUpdate {
        let before = self.ledger.len();
        let Some(route) = self.routes.remove(&connection_id) else {
            return self.update(before);
        };

        if let Some(position) = self
            .ledger
            .iter()
            .position(|e| e.connection == Some(connection_id))
        {
            let survivor = self
                .routes
                .iter()
                .find(|(_, other)| other.user_id == route.user_id)
                .map(|(id, _)| *id);

            match (survivor, self.ledger.get_mut(position)) {
                (Some(survivor), Some(entry)) => entry.connection = Some(survivor),
                _ => {
                    self.ledger.remove(position);
                }
            }
        }

        self.broadcast(
            &ServerEvent::UserLeft {
                connection_id,
                user_id: route.user_id,
            },
            None,
        );

        prom::record_membership_event("depart");
        debug!(
            target: "relay.actor.room",
            room_code = %self.room_code,
            connection_id = %connection_id,
            routes = self.routes.len(),
            "Connection departed"
        );

        self.update(before)
    }

    fn signal(
        &self,
        from: ConnectionId,
        target: Option<ConnectionId>,
        kind: Option<SignalKind>,
        payload: Value,
    ) {
        if !self.routes.contains_key(&from) {
            prom::record_signal_dropped("not_announced");
            return;
        }

        let kind_label = kind.map_or("unspecified", |k| k.as_str());
        let event = ServerEvent::Signal {
            from_connection_id: from,
            kind,
            payload,
        };

        match target {
            Some(target) => match self.routes.get(&target) {
                Some(route) => {
                    if self.push(target, route, ConnectionCommand::Deliver(event)) {
                        prom::record_signal_forwarded("unicast", kind_label);
                    }
                }
                None => {
                    trace!(
                        target: "relay.actor.room",
                        room_code = %self.room_code,
                        from = %from,
                        to = %target,
                        kind = kind_label,
                        "Signal target not in room, dropped"
                    );
                    prom::record_signal_dropped("unknown_target");
                }
            },
            None => {
                for (connection_id, route) in &self.routes {
                    if *connection_id != from
                        && self.push(*connection_id, route, ConnectionCommand::Deliver(event.clone()))
                    {
                        prom::record_signal_forwarded("broadcast", kind_label);
                    }
                }
            }
        }
    }

    /// Send `event` to every route except `except`.
    fn broadcast(&self, event: &ServerEvent, except: Option<ConnectionId>) {
        for (connection_id, route) in &self.routes {
            if Some(*connection_id) != except {
                self.push(*connection_id, route, ConnectionCommand::Deliver(event.clone()));
            }
        }
    }

    /// Queue a command to one connection without waiting. Returns whether it
    /// was queued.
    fn push(&self, connection_id: ConnectionId, route: &Route, command: ConnectionCommand) -> bool {
        let is_signal = matches!(
            command,
            ConnectionCommand::Deliver(ServerEvent::Signal { .. })
        );

        match route.outbound.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                prom::record_message_dropped(ActorType::Connection.as_str());
                if is_signal {
                    prom::record_signal_dropped("backpressure");
                }
                warn!(
                    target: "relay.actor.room",
                    room_code = %self.room_code,
                    connection_id = %connection_id,
                    "Connection queue full, event dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                if is_signal {
                    prom::record_signal_dropped("closed");
                }
                false
            }
        }
    }
}
