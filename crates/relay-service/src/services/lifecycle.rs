//! Meeting lifecycle coordination.
//!
//! Bridges HTTP lifecycle actions to the room registry and the durable
//! meeting record. The registry is authoritative; every store call here is
//! advisory, bounded by the configured store timeout, and its failure is
//! logged, counted and swallowed.
//!
//! Join and leave dispatch their store mutation with `tokio::spawn` after the
//! registry mutation has completed, so a slow or unreachable store never
//! delays a membership response. `create` and `end` await the store because
//! their responses carry store results (`record`, `deleted`).

use crate::actors::RoomRegistryHandle;
use crate::config::Config;
use crate::errors::RelayError;
use crate::models::{
    CreateMeeting, CreateMeetingResponse, EndMeetingResponse, MeetingRecord, NewMeeting,
    ParticipantsResponse, DEFAULT_MEETING_TITLE,
};
use crate::observability::metrics;
use crate::repositories::{MeetingStore, StoreError};

use common::types::{RoomCode, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Run one store call under `timeout`, recording latency and failures.
async fn timed_store_call<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    };

    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_latency(operation, status, start.elapsed());
    if result.is_err() {
        metrics::record_store_failure(operation);
    }
    result
}

/// Coordinator behind the `/meet` routes.
#[derive(Clone)]
pub struct MeetingLifecycle {
    registry: RoomRegistryHandle,
    store: Arc<dyn MeetingStore>,
    config: Arc<Config>,
}

impl MeetingLifecycle {
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        store: Arc<dyn MeetingStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Create the meeting record for `code`, or return the existing one.
    ///
    /// The shareable link is always recomputed from the configured client
    /// origin, including on reuse.
    ///
    /// # Errors
    ///
    /// `RelayError::ServiceUnavailable` when the store fails or times out.
    /// Unlike the membership mirrors there is nothing to return without it.
    #[instrument(skip_all, name = "relay.lifecycle.create", fields(room_code = %request.code))]
    pub async fn create_or_reuse(
        &self,
        request: CreateMeeting,
    ) -> Result<CreateMeetingResponse, RelayError> {
        let shareable_link = self.config.share_url(request.code.as_str());
        let meeting = NewMeeting {
            code: request.code,
            title: request
                .title
                .unwrap_or_else(|| DEFAULT_MEETING_TITLE.to_string()),
            description: request.description,
            host_user_id: request.host_user_id,
            share_url: shareable_link.clone(),
        };

        let store = Arc::clone(&self.store);
        let (record, created): (MeetingRecord, bool) = timed_store_call(
            "create",
            self.config.store_timeout,
            store.create_if_absent(meeting),
        )
        .await
        .map_err(|e| {
            warn!(target: "relay.services.lifecycle", error = %e, "Meeting create failed");
            RelayError::ServiceUnavailable(format!("meeting store: {e}"))
        })?;

        if created {
            info!(
                target: "relay.services.lifecycle",
                room_code = %record.code,
                host_user_id = %record.host_user_id,
                "Meeting created"
            );
        } else {
            debug!(target: "relay.services.lifecycle", room_code = %record.code, "Meeting reused");
        }

        Ok(CreateMeetingResponse {
            ok: true,
            record,
            shareable_link,
            reused: !created,
        })
    }

    /// Add `user_id` to the room and mirror the join into the record.
    ///
    /// The mirror runs only when the ledger actually gained an entry, so a
    /// retried beacon does not inflate the counter.
    #[instrument(skip_all, name = "relay.lifecycle.join", fields(room_code = %room_code))]
    pub async fn join(
        &self,
        room_code: RoomCode,
        user_id: UserId,
        name: Option<String>,
    ) -> Result<ParticipantsResponse, RelayError> {
        let update = self
            .registry
            .join(&room_code, user_id.clone(), name)
            .await?;

        if update.changed {
            let store = Arc::clone(&self.store);
            let timeout = self.config.store_timeout;
            let code = room_code.clone();
            tokio::spawn(async move {
                let result =
                    timed_store_call("record_join", timeout, store.record_join(&code, &user_id))
                        .await;
                log_mirror_result("record_join", &code, result);
            });
        }

        Ok(ParticipantsResponse {
            ok: true,
            room_code,
            participants: update.members,
        })
    }

    /// Remove `user_id` from the room and mirror the leave into the record.
    ///
    /// Unknown rooms and absent users return the current (possibly empty)
    /// member list and touch nothing.
    #[instrument(skip_all, name = "relay.lifecycle.leave", fields(room_code = %room_code))]
    pub async fn leave(
        &self,
        room_code: RoomCode,
        user_id: UserId,
    ) -> Result<ParticipantsResponse, RelayError> {
        let update = self.registry.leave(&room_code, &user_id).await?;

        if update.changed {
            let store = Arc::clone(&self.store);
            let timeout = self.config.store_timeout;
            let code = room_code.clone();
            tokio::spawn(async move {
                let result =
                    timed_store_call("record_leave", timeout, store.record_leave(&code)).await;
                log_mirror_result("record_leave", &code, result);
            });
        }

        Ok(ParticipantsResponse {
            ok: true,
            room_code,
            participants: update.members,
        })
    }

    /// End the room, then delete the record.
    ///
    /// Connected peers receive `meeting-ended` from the room actor before the
    /// store is touched. A store failure reports `deleted: false`.
    #[instrument(skip_all, name = "relay.lifecycle.end", fields(room_code = %room_code))]
    pub async fn end(&self, room_code: RoomCode) -> Result<EndMeetingResponse, RelayError> {
        let participants = self.registry.end(&room_code).await?;

        let store = Arc::clone(&self.store);
        let deleted = match timed_store_call(
            "delete",
            self.config.store_timeout,
            store.delete(&room_code),
        )
        .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(
                    target: "relay.services.lifecycle",
                    room_code = %room_code,
                    error = %e,
                    "Meeting delete failed, reporting not deleted"
                );
                false
            }
        };

        info!(
            target: "relay.services.lifecycle",
            room_code = %room_code,
            former_members = participants.len(),
            deleted,
            "Meeting ended"
        );

        Ok(EndMeetingResponse {
            ok: true,
            room_code,
            participants,
            deleted,
        })
    }

    /// Read-only member snapshot. Empty for an unknown room.
    pub async fn list(&self, room_code: RoomCode) -> Result<ParticipantsResponse, RelayError> {
        let participants = self.registry.list_members(&room_code).await?;
        Ok(ParticipantsResponse {
            ok: true,
            room_code,
            participants,
        })
    }
}

fn log_mirror_result(operation: &'static str, code: &RoomCode, result: Result<bool, StoreError>) {
    match result {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                target: "relay.services.lifecycle",
                room_code = %code,
                operation,
                "No meeting record to update"
            );
        }
        Err(e) => {
            warn!(
                target: "relay.services.lifecycle",
                room_code = %code,
                operation,
                error = %e,
                "Meeting record update failed"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::RelayMetrics;
    use crate::repositories::meetings::mock::{FailingMeetingStore, SlowMeetingStore};
    use crate::repositories::InMemoryMeetingStore;
    use std::collections::HashMap;

    fn config(store_timeout_ms: u64) -> Arc<Config> {
        let vars = HashMap::from([
            (
                "RELAY_STORE_TIMEOUT_MS".to_string(),
                store_timeout_ms.to_string(),
            ),
            (
                "RELAY_CLIENT_ORIGIN".to_string(),
                "https://meet.example.com".to_string(),
            ),
        ]);
        Arc::new(Config::from_vars(&vars).unwrap())
    }

    fn lifecycle(store: Arc<dyn MeetingStore>, store_timeout_ms: u64) -> MeetingLifecycle {
        let registry = RoomRegistryHandle::new(8, RelayMetrics::new());
        MeetingLifecycle::new(registry, store, config(store_timeout_ms))
    }

    fn create(code: &str, host: &str) -> CreateMeeting {
        CreateMeeting {
            code: RoomCode::parse(code).unwrap(),
            host_user_id: UserId::parse(host).unwrap(),
            title: None,
            description: None,
        }
    }

    fn code(value: &str) -> RoomCode {
        RoomCode::parse(value).unwrap()
    }

    fn user(value: &str) -> UserId {
        UserId::parse(value).unwrap()
    }

    /// Spawned mirrors run on the same runtime; give them a chance to land.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_create_twice_reuses_unchanged_record() {
        let service = lifecycle(Arc::new(InMemoryMeetingStore::new()), 2000);

        let first = service.create_or_reuse(create("X", "h1")).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.record.title, DEFAULT_MEETING_TITLE);
        assert_eq!(first.shareable_link, "https://meet.example.com/call?m=X");

        let second = service.create_or_reuse(create("X", "h2")).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.record, first.record);
        assert_eq!(second.shareable_link, first.shareable_link);
    }

    #[tokio::test]
    async fn test_create_with_failing_store_is_unavailable() {
        let service = lifecycle(Arc::new(FailingMeetingStore::new()), 2000);
        let result = service.create_or_reuse(create("X", "h1")).await;
        assert!(matches!(result, Err(RelayError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_join_mirrors_only_new_entries() {
        let store = Arc::new(InMemoryMeetingStore::new());
        let service = lifecycle(store.clone(), 2000);
        service.create_or_reuse(create("X", "h1")).await.unwrap();

        service.join(code("X"), user("u1"), None).await.unwrap();
        service
            .join(code("X"), user("u1"), Some("Ada".to_string()))
            .await
            .unwrap();
        settle().await;

        let record = store.get(&code("X")).await.unwrap().unwrap();
        assert_eq!(record.people_in_call, 2, "host plus one counted join");
        assert!(record.participant_ids.contains(&user("u1")));
    }

    #[tokio::test]
    async fn test_leave_of_absent_user_touches_nothing() {
        let store = Arc::new(InMemoryMeetingStore::new());
        let service = lifecycle(store.clone(), 2000);
        service.create_or_reuse(create("X", "h1")).await.unwrap();

        let response = service.leave(code("X"), user("ghost")).await.unwrap();
        assert!(response.ok);
        assert!(response.participants.is_empty());
        settle().await;

        let record = store.get(&code("X")).await.unwrap().unwrap();
        assert_eq!(record.people_in_call, 1);
    }

    #[tokio::test]
    async fn test_join_succeeds_when_store_fails() {
        let store = Arc::new(FailingMeetingStore::new());
        let service = lifecycle(store.clone(), 2000);

        let response = service.join(code("R1"), user("a"), None).await.unwrap();
        assert_eq!(response.participants.len(), 1);

        let response = service.leave(code("R1"), user("a")).await.unwrap();
        assert!(response.participants.is_empty());
        settle().await;

        assert_eq!(store.call_count(), 2, "both mirrors attempted, both swallowed");
    }

    #[tokio::test]
    async fn test_join_does_not_wait_for_slow_store() {
        let service = lifecycle(Arc::new(SlowMeetingStore::new(Duration::from_secs(5))), 10_000);

        let started = Instant::now();
        let response = service.join(code("R1"), user("a"), None).await.unwrap();
        assert_eq!(response.participants.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_end_of_unknown_room_reports_not_deleted() {
        let service = lifecycle(Arc::new(InMemoryMeetingStore::new()), 2000);

        let response = service.end(code("R1")).await.unwrap();
        assert!(response.participants.is_empty());
        assert!(!response.deleted);
    }

    #[tokio::test]
    async fn test_end_returns_members_and_deletes_record() {
        let store = Arc::new(InMemoryMeetingStore::new());
        let service = lifecycle(store.clone(), 2000);
        service.create_or_reuse(create("X", "h1")).await.unwrap();
        service.join(code("X"), user("h1"), None).await.unwrap();
        service.join(code("X"), user("u2"), None).await.unwrap();

        let response = service.end(code("X")).await.unwrap();
        assert_eq!(response.participants.len(), 2);
        assert!(response.deleted);

        assert!(service.list(code("X")).await.unwrap().participants.is_empty());
        assert!(store.get(&code("X")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_store_timeout_reports_not_deleted() {
        let service = lifecycle(Arc::new(SlowMeetingStore::new(Duration::from_secs(5))), 50);
        service.join(code("R1"), user("a"), None).await.unwrap();

        let response = service.end(code("R1")).await.unwrap();
        assert_eq!(response.participants.len(), 1);
        assert!(!response.deleted);
    }
}
