//! `ConnectionActor` - one per relay WebSocket.
//!
//! Each `ConnectionActor`:
//! - Owns exactly one WebSocket and a fresh `ConnectionId`
//! - Is in at most one room at a time
//! - Forwards client events to its room actor and writes queued room events
//!   back to the client, in order
//!
//! # State machine
//!
//! `Connected -> Announced { room, user } -> Closed`. A `join-room` for a
//! different room (or identity) departs the current room first. An explicit
//! `leave-room`, an HTTP eviction, or the room ending returns the connection
//! to `Connected`. Transport close always departs, with or without a prior
//! `leave-room`, so presence never depends on the client saying goodbye.
//!
//! Every announcement gets a fresh epoch. Room commands carry the epoch of
//! the route they concern, and a command for an older announcement is
//! ignored, so a queued `RoomEnded` or `Evicted` cannot undo a later
//! `join-room`.

use crate::errors::RelayError;
use crate::observability::metrics as prom;

use super::messages::ConnectionCommand;
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;

use axum::extract::ws::{Message, WebSocket};
use common::types::{ConnectionId, RoomCode, UserId};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{
    decode_client_event, encode_server_event, Announcement, ClientEvent, ServerEvent,
    SignalRequest,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Default channel buffer size for a connection's outbound queue.
const CONNECTION_CHANNEL_BUFFER: usize = 256;

#[derive(Debug)]
enum ConnectionState {
    Connected,
    Announced {
        room: RoomActorHandle,
        room_code: RoomCode,
        user_id: UserId,
        epoch: u64,
    },
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    registry: RoomRegistryHandle,
    cancel_token: CancellationToken,
    state: ConnectionState,
    announce_epoch: u64,
    outbound_tx: mpsc::Sender<ConnectionCommand>,
    outbound_rx: mpsc::Receiver<ConnectionCommand>,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Create an actor for a freshly upgraded socket. Cancellation follows the
    /// registry.
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, metrics: Arc<RelayMetrics>) -> Self {
        let connection_id = ConnectionId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        Self {
            connection_id,
            cancel_token: registry.child_token(),
            registry,
            state: ConnectionState::Connected,
            announce_epoch: 0,
            outbound_tx,
            outbound_rx,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, connection_id.to_string()),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Room this connection is announced in, if any.
    #[must_use]
    pub fn current_room(&self) -> Option<&RoomCode> {
        match &self.state {
            ConnectionState::Connected => None,
            ConnectionState::Announced { room_code, .. } => Some(room_code),
        }
    }

    /// Drive the socket until the client goes away or the relay shuts down.
    #[instrument(skip_all, name = "relay.actor.connection", fields(connection_id = %self.connection_id))]
    pub async fn run(mut self, socket: WebSocket) {
        self.metrics.connection_opened();
        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "Connection opened"
        );

        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_frame(&text).await {
                                if write_event(&mut sink, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                error = %e,
                                "Transport error"
                            );
                            break;
                        }
                    }
                }

                Some(command) = self.outbound_rx.recv() => {
                    self.mailbox.record_processed(self.outbound_rx.len());
                    if let Some(event) = self.handle_command(command) {
                        if write_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.depart_current_room().await;
        self.metrics.connection_closed();
        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            events_written = self.mailbox.messages_processed(),
            "Connection closed"
        );
    }

    /// Handle one client text frame. Returns the reply for the client, if any.
    async fn handle_frame(&mut self, text: &str) -> Option<ServerEvent> {
        let event = match decode_client_event(text) {
            Ok(event) => event,
            Err(err) => return Some(reject(&RelayError::from(err))),
        };

        trace!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            event = event.name(),
            "Client event"
        );

        match event {
            ClientEvent::JoinRoom(join) => match join.validate() {
                Ok(announcement) => self.announce(announcement).await,
                Err(err) => Some(reject(&RelayError::from(err))),
            },
            ClientEvent::LeaveRoom(leave) => match leave.validate() {
                Ok((room_code, _user_id)) => {
                    if self.current_room() == Some(&room_code) {
                        self.depart_current_room().await;
                    }
                    None
                }
                Err(err) => Some(reject(&RelayError::from(err))),
            },
            ClientEvent::Signal(request) => {
                self.signal(request).await;
                None
            }
        }
    }

    async fn announce(&mut self, announcement: Announcement) -> Option<ServerEvent> {
        let Announcement {
            room_code,
            user_id,
            display_name,
        } = announcement;

        let switching = matches!(
            &self.state,
            ConnectionState::Announced {
                room_code: current_room,
                user_id: current_user,
                ..
            } if current_room != &room_code || current_user != &user_id
        );
        if switching {
            self.depart_current_room().await;
        }

        self.announce_epoch += 1;
        let epoch = self.announce_epoch;

        match self
            .registry
            .announce(
                &room_code,
                self.connection_id,
                user_id.clone(),
                display_name,
                self.outbound_tx.clone(),
                epoch,
            )
            .await
        {
            Ok((room, _update)) => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    room_code = %room_code,
                    user_id = %user_id,
                    epoch,
                    "Connection announced"
                );
                self.state = ConnectionState::Announced {
                    room,
                    room_code,
                    user_id,
                    epoch,
                };
                None
            }
            Err(err) => {
                warn!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    room_code = %room_code,
                    error = %err,
                    "Announcement refused"
                );
                Some(reject(&err))
            }
        }
    }

    async fn signal(&self, request: SignalRequest) {
        let ConnectionState::Announced {
            room, room_code, ..
        } = &self.state
        else {
            prom::record_signal_dropped("not_announced");
            return;
        };

        let requested = request.room_code.as_deref().filter(|c| !c.is_empty());
        if requested.is_some_and(|c| c != room_code.as_str()) {
            prom::record_signal_dropped("room_mismatch");
            return;
        }

        if room
            .signal(
                self.connection_id,
                request.target_connection_id,
                request.kind,
                request.payload,
            )
            .await
            .is_err()
        {
            prom::record_signal_dropped("closed");
        }
    }

    /// Apply a room command. Returns the event to write to the client, if any.
    fn handle_command(&mut self, command: ConnectionCommand) -> Option<ServerEvent> {
        match command {
            ConnectionCommand::Deliver(event) => Some(event),
            ConnectionCommand::RoomEnded { room_code, epoch } => {
                if self.is_current(&room_code, epoch) {
                    self.state = ConnectionState::Connected;
                    Some(ServerEvent::MeetingEnded {})
                } else {
                    None
                }
            }
            ConnectionCommand::Evicted { room_code, epoch } => {
                if self.is_current(&room_code, epoch) {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        room_code = %room_code,
                        "Connection evicted by leave"
                    );
                    self.state = ConnectionState::Connected;
                }
                None
            }
        }
    }

    /// Whether a room command for `room_code` at `epoch` still concerns the
    /// current announcement.
    fn is_current(&self, room_code: &RoomCode, epoch: u64) -> bool {
        matches!(
            &self.state,
            ConnectionState::Announced {
                room_code: current_room,
                epoch: current_epoch,
                ..
            } if current_room == room_code && *current_epoch == epoch
        )
    }

    async fn depart_current_room(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Connected);
        if let ConnectionState::Announced {
            room, room_code, ..
        } = state
        {
            // A stopped room has already forgotten this connection.
            let _ = room.depart(self.connection_id).await;
            debug!(
                target: "relay.actor.connection",
                connection_id = %self.connection_id,
                room_code = %room_code,
                "Connection departed room"
            );
        }
    }
}

fn reject(err: &RelayError) -> ServerEvent {
    ServerEvent::error(err.error_code(), err.client_message())
}

async fn write_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    match encode_server_event(event) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(
                target: "relay.actor.connection",
                event = event.name(),
                error = %e,
                "Failed to encode server event"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use signaling_protocol::{encode_client_event, JoinRoom, LeaveRoom, SignalKind};

    fn registry(capacity: usize) -> RoomRegistryHandle {
        RoomRegistryHandle::new(capacity, RelayMetrics::new())
    }

    fn join_frame(room: &str, user: &str) -> String {
        encode_client_event(&ClientEvent::JoinRoom(JoinRoom::new(
            &RoomCode::parse(room).unwrap(),
            &UserId::parse(user).unwrap(),
            None,
        )))
        .unwrap()
    }

    fn leave_frame(room: &str, user: &str) -> String {
        encode_client_event(&ClientEvent::LeaveRoom(LeaveRoom::new(
            &RoomCode::parse(room).unwrap(),
            &UserId::parse(user).unwrap(),
        )))
        .unwrap()
    }

    fn signal_frame(target: ConnectionId, payload: serde_json::Value) -> String {
        encode_client_event(&ClientEvent::Signal(SignalRequest::unicast(
            target,
            SignalKind::Offer,
            payload,
        )))
        .unwrap()
    }

    /// Wait until the room has processed everything queued before.
    async fn settle(registry: &RoomRegistryHandle, room: &str) {
        registry
            .list_members(&RoomCode::parse(room).unwrap())
            .await
            .unwrap();
    }

    fn drain(actor: &mut ConnectionActor) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(command) = actor.outbound_rx.try_recv() {
            if let Some(event) = actor.handle_command(command) {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_second_announcer_is_broadcast_to_first() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());

        assert!(a.handle_frame(&join_frame("R1", "A")).await.is_none());
        assert!(b.handle_frame(&join_frame("R1", "B")).await.is_none());
        settle(&registry, "R1").await;

        assert_eq!(
            drain(&mut a),
            vec![ServerEvent::UserJoined {
                user_id: UserId::parse("B").unwrap(),
                name: None,
                connection_id: b.connection_id(),
            }]
        );
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_unicast_offer_arrives_verbatim() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        a.handle_frame(&join_frame("R1", "A")).await;
        b.handle_frame(&join_frame("R1", "B")).await;

        a.handle_frame(&signal_frame(b.connection_id(), json!("offer")))
            .await;
        settle(&registry, "R1").await;

        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::Signal {
                from_connection_id: a.connection_id(),
                kind: Some(SignalKind::Offer),
                payload: json!("offer"),
            }]
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_get_error_reply() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry, RelayMetrics::new());

        match a.handle_frame("not json").await {
            Some(ServerEvent::Error { code, .. }) => assert_eq!(code, "BAD_REQUEST"),
            other => panic!("expected error reply, got {other:?}"),
        }

        let missing_user = r#"{"event":"join-room","data":{"roomCode":"R1"}}"#;
        match a.handle_frame(missing_user).await {
            Some(ServerEvent::Error { message, .. }) => assert!(message.contains("userId")),
            other => panic!("expected error reply, got {other:?}"),
        }
        assert!(a.current_room().is_none(), "no state mutated");
    }

    #[tokio::test]
    async fn test_signal_before_announce_is_dropped() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        b.handle_frame(&join_frame("R1", "B")).await;

        assert!(a
            .handle_frame(&signal_frame(b.connection_id(), json!("offer")))
            .await
            .is_none());
        settle(&registry, "R1").await;
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_leave_room_broadcasts_once() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        b.handle_frame(&join_frame("R1", "B")).await;
        a.handle_frame(&join_frame("R1", "A")).await;
        settle(&registry, "R1").await;
        drain(&mut b);

        a.handle_frame(&leave_frame("R1", "A")).await;
        a.handle_frame(&leave_frame("R1", "A")).await;
        settle(&registry, "R1").await;

        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::UserLeft {
                connection_id: a.connection_id(),
                user_id: UserId::parse("A").unwrap(),
            }]
        );
        assert!(a.current_room().is_none());
    }

    #[tokio::test]
    async fn test_announce_into_other_room_departs_first() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        b.handle_frame(&join_frame("R1", "B")).await;
        a.handle_frame(&join_frame("R1", "A")).await;
        settle(&registry, "R1").await;
        drain(&mut b);

        a.handle_frame(&join_frame("R2", "A")).await;
        settle(&registry, "R1").await;

        assert_eq!(a.current_room().map(RoomCode::as_str), Some("R2"));
        assert!(matches!(
            drain(&mut b).as_slice(),
            [ServerEvent::UserLeft { .. }]
        ));
        let members = registry
            .list_members(&RoomCode::parse("R1").unwrap())
            .await
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_room_end_resets_to_connected() {
        let registry = registry(8);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        a.handle_frame(&join_frame("R1", "A")).await;

        registry.end(&RoomCode::parse("R1").unwrap()).await.unwrap();

        assert_eq!(drain(&mut a), vec![ServerEvent::MeetingEnded {}]);
        assert!(a.current_room().is_none());
    }

    #[tokio::test]
    async fn test_rejoin_after_room_end_survives_queued_end() {
        let registry = registry(8);
        let r1 = RoomCode::parse("R1").unwrap();
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        a.handle_frame(&join_frame("R1", "A")).await;

        registry.end(&r1).await.unwrap();
        // Re-announced before the queued end is applied.
        assert!(a.handle_frame(&join_frame("R1", "A")).await.is_none());

        assert!(drain(&mut a).is_empty(), "stale end is ignored");
        assert_eq!(a.current_room(), Some(&r1));

        a.depart_current_room().await;
        assert!(registry.list_members(&r1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_after_eviction_survives_queued_eviction() {
        let registry = registry(8);
        let r1 = RoomCode::parse("R1").unwrap();
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        b.handle_frame(&join_frame("R1", "B")).await;
        a.handle_frame(&join_frame("R1", "A")).await;

        registry
            .leave(&r1, &UserId::parse("A").unwrap())
            .await
            .unwrap();
        a.handle_frame(&join_frame("R1", "A")).await;

        drain(&mut a);
        assert_eq!(a.current_room(), Some(&r1));

        a.depart_current_room().await;
        let members = registry.list_members(&r1).await.unwrap();
        let ids: Vec<&str> = members.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["B"]);
    }

    #[tokio::test]
    async fn test_http_join_is_silent_to_live_connections() {
        let registry = registry(8);
        let r1 = RoomCode::parse("R1").unwrap();
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        a.handle_frame(&join_frame("R1", "A")).await;

        let update = registry
            .join(&r1, UserId::parse("H").unwrap(), Some("Guest".to_string()))
            .await
            .unwrap();
        assert_eq!(update.members.len(), 2);

        settle(&registry, "R1").await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_room_full_is_reported_to_client() {
        let registry = registry(2);
        let mut a = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut b = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        let mut c = ConnectionActor::new(registry.clone(), RelayMetrics::new());
        a.handle_frame(&join_frame("R1", "A")).await;
        b.handle_frame(&join_frame("R1", "B")).await;

        match c.handle_frame(&join_frame("R1", "C")).await {
            Some(ServerEvent::Error { code, .. }) => assert_eq!(code, "ROOM_FULL"),
            other => panic!("expected ROOM_FULL, got {other:?}"),
        }
        assert!(c.current_room().is_none());
    }
}
