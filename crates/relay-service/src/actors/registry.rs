//! `RoomRegistryActor` - singleton index of live rooms.
//!
//! The registry only resolves room codes to `RoomActor` handles and spawns a
//! room on first use. Membership mutations run inside the owning room actor,
//! so two rooms never wait on each other and the registry is never held
//! across a room operation.
//!
//! `RoomRegistryHandle` is the contract the rest of the service uses:
//! `join`, `leave`, `list_members` and `end` never fail for an unknown room,
//! they return empty results. A room that stops while a request is in flight
//! is re-resolved a bounded number of times.

use crate::errors::RelayError;
use crate::models::{MembershipUpdate, Participant};

use super::messages::{ConnectionCommand, RegistryMessage, RegistryStatus};
use super::metrics::{ActorType, MailboxMonitor, RelayMetrics};
use super::room::{RoomActor, RoomActorHandle, RoomStopped};

use common::types::{ConnectionId, RoomCode, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How many times a request is re-resolved after racing with a stopping room.
const RESOLVE_ATTEMPTS: usize = 3;

/// Handle to the `RoomRegistryActor`.
#[derive(Debug, Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    ///
    /// # Arguments
    ///
    /// * `max_room_participants` - Mesh capacity handed to every room
    /// * `metrics` - Shared relay metrics
    #[must_use]
    pub fn new(max_room_participants: usize, metrics: Arc<RelayMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            receiver,
            room_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            max_room_participants,
            rooms: HashMap::new(),
            stopping: Vec::new(),
            next_generation: 0,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn resolve(
        &self,
        room_code: &RoomCode,
        create: bool,
    ) -> Result<Option<RoomActorHandle>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Resolve {
                room_code: room_code.clone(),
                create,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("registry send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("registry response failed: {e}")))
    }

    /// Run `op` against the live room, re-resolving if the room stops under it.
    /// `absent` supplies the result for a room that does not exist.
    async fn with_room<T, F, Fut>(
        &self,
        room_code: &RoomCode,
        create: bool,
        absent: impl Fn() -> T,
        op: F,
    ) -> Result<T, RelayError>
    where
        F: Fn(RoomActorHandle) -> Fut,
        Fut: Future<Output = Result<T, RoomStopped>>,
    {
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let Some(room) = self.resolve(room_code, create).await? else {
                return Ok(absent());
            };

            match op(room).await {
                Ok(value) => return Ok(value),
                Err(RoomStopped) => {
                    debug!(
                        target: "relay.actor.registry",
                        room_code = %room_code,
                        attempt = attempt,
                        "Room stopped during request, re-resolving"
                    );
                }
            }
        }

        Err(RelayError::Internal(format!(
            "room kept stopping after {RESOLVE_ATTEMPTS} attempts"
        )))
    }

    /// Insert or replace `user_id` in the room, creating the room if needed.
    pub async fn join(
        &self,
        room_code: &RoomCode,
        user_id: UserId,
        name: Option<String>,
    ) -> Result<MembershipUpdate, RelayError> {
        self.with_room(room_code, true, MembershipUpdate::absent, |room| {
            let user_id = user_id.clone();
            let name = name.clone();
            async move { room.join(user_id, name).await }
        })
        .await
    }

    /// Remove `user_id` from the room. Unknown rooms and users are a no-op.
    pub async fn leave(
        &self,
        room_code: &RoomCode,
        user_id: &UserId,
    ) -> Result<MembershipUpdate, RelayError> {
        self.with_room(room_code, false, MembershipUpdate::absent, |room| {
            let user_id = user_id.clone();
            async move { room.leave(user_id).await }
        })
        .await
    }

    /// Read-only snapshot. Empty for an unknown room.
    pub async fn list_members(&self, room_code: &RoomCode) -> Result<Vec<Participant>, RelayError> {
        self.with_room(room_code, false, Vec::new, |room| async move {
            room.list().await
        })
        .await
    }

    /// End the room and return its former members. Empty for an unknown room.
    pub async fn end(&self, room_code: &RoomCode) -> Result<Vec<Participant>, RelayError> {
        self.with_room(room_code, false, Vec::new, |room| async move {
            room.end().await
        })
        .await
    }

    /// Attach a relay connection to the room, creating the room if needed.
    ///
    /// Returns the room handle the connection uses for signals and departure.
    ///
    /// # Errors
    ///
    /// `RelayError::RoomFull` when the room is at mesh capacity.
    pub async fn announce(
        &self,
        room_code: &RoomCode,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: Option<String>,
        outbound: mpsc::Sender<ConnectionCommand>,
        epoch: u64,
    ) -> Result<(RoomActorHandle, MembershipUpdate), RelayError> {
        self.with_room(
            room_code,
            true,
            || Err(RelayError::Internal("room could not be created".to_string())),
            |room| {
                let user_id = user_id.clone();
                let display_name = display_name.clone();
                let outbound = outbound.clone();
                async move {
                    let outcome = room
                        .announce(connection_id, user_id, display_name, outbound, epoch)
                        .await;
                    outcome.map(|result| result.map(|update| (room, update)))
                }
            },
        )
        .await?
    }

    pub async fn status(&self) -> Result<RegistryStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("registry send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("registry response failed: {e}")))
    }

    /// Cancel the registry and every room and connection below it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for actors that should stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to rooms for their stop notification. Weak so the registry does
    /// not keep its own mailbox open.
    room_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    max_room_participants: usize,
    rooms: HashMap<RoomCode, ManagedRoom>,
    /// Rooms removed from the index whose task has not finished yet.
    stopping: Vec<(RoomCode, JoinHandle<()>)>,
    next_generation: u64,
    metrics: Arc<RelayMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "relay.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "relay.actor.registry",
            max_room_participants = self.max_room_participants,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else { break };
                    self.mailbox.record_processed(self.receiver.len());
                    self.handle_message(message).await;
                }
            }
        }

        for (_, managed) in self.rooms.drain() {
            managed.handle.cancel();
            self.metrics.room_closed();
        }

        info!(
            target: "relay.actor.registry",
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Resolve {
                room_code,
                create,
                respond_to,
            } => {
                let handle = self.resolve(room_code, create);
                let _ = respond_to.send(handle);
            }

            RegistryMessage::RoomStopped {
                room_code,
                generation,
            } => {
                let current = self
                    .rooms
                    .get(&room_code)
                    .is_some_and(|m| m.handle.generation() == generation);
                if current {
                    self.retire(&room_code);
                }
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    rooms: self.rooms.len(),
                });
            }
        }
    }

    fn resolve(&mut self, room_code: RoomCode, create: bool) -> Option<RoomActorHandle> {
        if let Some(managed) = self.rooms.get(&room_code) {
            if !managed.handle.is_stopped() {
                return Some(managed.handle.clone());
            }
            self.retire(&room_code);
        }

        if !create || self.cancel_token.is_cancelled() {
            return None;
        }
        let registry = self.room_sender.upgrade()?;

        self.next_generation += 1;
        let (handle, task_handle) = RoomActor::spawn(
            room_code.clone(),
            self.next_generation,
            registry,
            self.cancel_token.child_token(),
            self.max_room_participants,
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_code.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.room_opened();

        debug!(
            target: "relay.actor.registry",
            room_code = %room_code,
            generation = self.next_generation,
            total_rooms = self.rooms.len(),
            "Room actor spawned"
        );

        Some(handle)
    }

    /// Drop a room from the index; its task is watched until it finishes.
    fn retire(&mut self, room_code: &RoomCode) {
        if let Some(managed) = self.rooms.remove(room_code) {
            self.metrics.room_closed();
            self.stopping.push((room_code.clone(), managed.task_handle));
            debug!(
                target: "relay.actor.registry",
                room_code = %room_code,
                total_rooms = self.rooms.len(),
                "Room retired"
            );
        }
    }

    /// Reap finished room tasks and surface panics.
    async fn check_room_health(&mut self) {
        let crashed: Vec<RoomCode> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(code, _)| code.clone())
            .collect();
        for room_code in crashed {
            self.retire(&room_code);
        }

        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stopping)
            .into_iter()
            .partition(|(_, task)| task.is_finished());
        self.stopping = pending;

        for (room_code, task) in finished {
            if let Err(join_error) = task.await {
                if join_error.is_panic() {
                    error!(
                        target: "relay.actor.registry",
                        room_code = %room_code,
                        "Room actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn code(c: &str) -> RoomCode {
        RoomCode::parse(c).unwrap()
    }

    fn user(u: &str) -> UserId {
        UserId::parse(u).unwrap()
    }

    fn ids(members: &[Participant]) -> Vec<String> {
        members.iter().map(|p| p.user_id.to_string()).collect()
    }

    async fn wait_for_rooms(registry: &RoomRegistryHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.status().await.unwrap().rooms != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room count should converge");
    }

    #[tokio::test]
    async fn test_unknown_room_is_empty_not_error() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());

        assert!(registry.list_members(&code("nope")).await.unwrap().is_empty());
        let update = registry.leave(&code("nope"), &user("u")).await.unwrap();
        assert!(!update.changed);
        assert!(update.members.is_empty());
        assert!(registry.end(&code("nope")).await.unwrap().is_empty());
        assert_eq!(registry.status().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_join_leave_sequence_matches_net_membership() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());
        let r1 = code("R1");

        registry.join(&r1, user("a"), None).await.unwrap();
        registry.join(&r1, user("b"), None).await.unwrap();
        registry.join(&r1, user("c"), None).await.unwrap();
        registry.leave(&r1, &user("b")).await.unwrap();
        registry.join(&r1, user("a"), Some("again".into())).await.unwrap();

        let members = registry.list_members(&r1).await.unwrap();
        assert_eq!(ids(&members), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_room_removed_after_last_leave_and_recreated_on_join() {
        let metrics = RelayMetrics::new();
        let registry = RoomRegistryHandle::new(8, Arc::clone(&metrics));
        let r1 = code("R1");

        registry.join(&r1, user("a"), None).await.unwrap();
        assert_eq!(registry.status().await.unwrap().rooms, 1);

        registry.leave(&r1, &user("a")).await.unwrap();
        // Immediately rejoin; this may race with the stopping actor.
        let update = registry.join(&r1, user("b"), None).await.unwrap();
        assert_eq!(ids(&update.members), vec!["b"]);

        registry.leave(&r1, &user("b")).await.unwrap();
        wait_for_rooms(&registry, 0).await;
        assert!(registry.list_members(&r1).await.unwrap().is_empty());
        assert_eq!(metrics.room_count(), 0);
    }

    #[tokio::test]
    async fn test_end_returns_snapshot_and_deletes_room() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());
        let r1 = code("R1");

        registry.join(&r1, user("a"), None).await.unwrap();
        registry.join(&r1, user("b"), None).await.unwrap();

        let former = registry.end(&r1).await.unwrap();
        assert_eq!(ids(&former), vec!["a", "b"]);

        wait_for_rooms(&registry, 0).await;
        assert!(registry.list_members(&r1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_joins_are_not_lost() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());
        let r1 = code("R1");

        let tasks: Vec<_> = (0..25)
            .map(|i| {
                let registry = registry.clone();
                let r1 = r1.clone();
                tokio::spawn(async move {
                    registry
                        .join(&r1, user(&format!("u{i}")), None)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.list_members(&r1).await.unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());

        registry.join(&code("A"), user("a"), None).await.unwrap();
        registry.join(&code("B"), user("b"), None).await.unwrap();
        registry.end(&code("A")).await.unwrap();

        assert_eq!(ids(&registry.list_members(&code("B")).await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_announce_respects_capacity() {
        let registry = RoomRegistryHandle::new(2, RelayMetrics::new());
        let r1 = code("R1");
        let (tx, _rx) = mpsc::channel(16);

        for u in ["a", "b"] {
            registry
                .announce(&r1, ConnectionId::new(), user(u), None, tx.clone(), 1)
                .await
                .unwrap();
        }

        let refused = registry
            .announce(&r1, ConnectionId::new(), user("c"), None, tx, 1)
            .await;
        assert!(matches!(refused, Err(RelayError::RoomFull { capacity: 2 })));
    }

    #[tokio::test]
    async fn test_cancel_stops_new_rooms() {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());
        registry.cancel();
        assert!(registry.is_cancelled());

        // The actor is gone or refuses to spawn; either way no room appears.
        let result = registry.join(&code("R1"), user("a"), None).await;
        assert!(result.is_err() || result.unwrap().members.is_empty());
    }
}
