//! Durable meeting records.
//!
//! The record is advisory: it backs the share link and a display/audit
//! counter, never "who is connected". Two backends implement `MeetingStore`:
//!
//! - `InMemoryMeetingStore` when no database is configured
//! - `PgMeetingStore` (sqlx, parameterized runtime queries) otherwise
//!
//! Neither backend applies timeouts or records metrics; the lifecycle
//! coordinator wraps every call uniformly.

use crate::models::{MeetingRecord, NewMeeting, DEFAULT_DURATION_MINUTES, DEFAULT_MAX_PARTICIPANTS};

use async_trait::async_trait;
use chrono::Utc;
use common::types::{RoomCode, UserId};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

/// Durable store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Database(String),

    #[error("store call exceeded {0:?}")]
    Timeout(std::time::Duration),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Trait for durable meeting storage (enables mocking).
#[async_trait]
pub trait MeetingStore: Send + Sync {
    /// Insert `meeting` unless a record with its code exists.
    ///
    /// Returns the stored record and whether it was created by this call.
    async fn create_if_absent(&self, meeting: NewMeeting)
        -> Result<(MeetingRecord, bool), StoreError>;

    async fn get(&self, code: &RoomCode) -> Result<Option<MeetingRecord>, StoreError>;

    /// Count a join: add the user to `participant_ids`, increment
    /// `people_in_call`, mark active. Returns whether a record was updated.
    async fn record_join(&self, code: &RoomCode, user_id: &UserId) -> Result<bool, StoreError>;

    /// Count a leave: decrement `people_in_call`, never below zero.
    async fn record_leave(&self, code: &RoomCode) -> Result<bool, StoreError>;

    /// Returns whether a record was deleted.
    async fn delete(&self, code: &RoomCode) -> Result<bool, StoreError>;
}

/// Process-local store. Records vanish on restart.
#[derive(Debug, Default)]
pub struct InMemoryMeetingStore {
    records: RwLock<HashMap<RoomCode, MeetingRecord>>,
}

impl InMemoryMeetingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingStore for InMemoryMeetingStore {
    async fn create_if_absent(
        &self,
        meeting: NewMeeting,
    ) -> Result<(MeetingRecord, bool), StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&meeting.code) {
            return Ok((existing.clone(), false));
        }
        let record = MeetingRecord::initial(meeting, Utc::now());
        records.insert(record.code.clone(), record.clone());
        Ok((record, true))
    }

    async fn get(&self, code: &RoomCode) -> Result<Option<MeetingRecord>, StoreError> {
        Ok(self.records.read().await.get(code).cloned())
    }

    async fn record_join(&self, code: &RoomCode, user_id: &UserId) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(code) else {
            return Ok(false);
        };
        if !record.participant_ids.contains(user_id) {
            record.participant_ids.push(user_id.clone());
        }
        record.people_in_call = record.people_in_call.saturating_add(1);
        record.is_active = true;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_leave(&self, code: &RoomCode) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(code) else {
            return Ok(false);
        };
        record.people_in_call = (record.people_in_call - 1).max(0);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete(&self, code: &RoomCode) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(code).is_some())
    }
}

const RECORD_COLUMNS: &str = "code, title, description, host_user_id, share_url, is_active, \
     people_in_call, max_participants, participant_ids, scheduled_time, duration_minutes, \
     created_at, updated_at";

/// PostgreSQL-backed store. See `migrations/` for the schema.
#[derive(Debug, Clone)]
pub struct PgMeetingStore {
    pool: PgPool,
}

impl PgMeetingStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeetingStore for PgMeetingStore {
    #[instrument(skip_all, name = "relay.repo.meetings.create")]
    async fn create_if_absent(
        &self,
        meeting: NewMeeting,
    ) -> Result<(MeetingRecord, bool), StoreError> {
        let now = Utc::now();

        let inserted = sqlx::query(&format!(
            r"
            INSERT INTO meetings (
                code, title, description, host_user_id, share_url, is_active,
                people_in_call, max_participants, participant_ids,
                scheduled_time, duration_minutes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, true, 1, $6, ARRAY[$4]::text[], $7, $8, $7, $7)
            ON CONFLICT (code) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "
        ))
        .bind(meeting.code.as_str()) // $1
        .bind(&meeting.title) // $2
        .bind(meeting.description.as_deref()) // $3
        .bind(meeting.host_user_id.as_str()) // $4
        .bind(&meeting.share_url) // $5
        .bind(DEFAULT_MAX_PARTICIPANTS) // $6
        .bind(now) // $7
        .bind(DEFAULT_DURATION_MINUTES) // $8
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((map_row_to_record(&row)?, true));
        }

        match self.get(&meeting.code).await? {
            Some(existing) => Ok((existing, false)),
            None => Err(StoreError::Database(
                "meeting deleted between insert and read".to_string(),
            )),
        }
    }

    #[instrument(skip_all, name = "relay.repo.meetings.get")]
    async fn get(&self, code: &RoomCode) -> Result<Option<MeetingRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM meetings WHERE code = $1"
        ))
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_row_to_record).transpose()
    }

    #[instrument(skip_all, name = "relay.repo.meetings.record_join")]
    async fn record_join(&self, code: &RoomCode, user_id: &UserId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE meetings
            SET participant_ids = CASE
                    WHEN $2 = ANY(participant_ids) THEN participant_ids
                    ELSE array_append(participant_ids, $2)
                END,
                people_in_call = people_in_call + 1,
                is_active = true,
                updated_at = NOW()
            WHERE code = $1
            ",
        )
        .bind(code.as_str())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, name = "relay.repo.meetings.record_leave")]
    async fn record_leave(&self, code: &RoomCode) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE meetings
            SET people_in_call = GREATEST(people_in_call - 1, 0),
                updated_at = NOW()
            WHERE code = $1
            ",
        )
        .bind(code.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, name = "relay.repo.meetings.delete")]
    async fn delete(&self, code: &RoomCode) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM meetings WHERE code = $1")
            .bind(code.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn map_row_to_record(row: &sqlx::postgres::PgRow) -> Result<MeetingRecord, StoreError> {
    let code: String = row.try_get("code")?;
    let host: String = row.try_get("host_user_id")?;
    let participant_ids: Vec<String> = row.try_get("participant_ids")?;

    Ok(MeetingRecord {
        code: RoomCode::parse(code)
            .ok_or_else(|| StoreError::Database("empty meeting code".to_string()))?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        host_user_id: UserId::parse(host)
            .ok_or_else(|| StoreError::Database("empty host user id".to_string()))?,
        share_url: row.try_get("share_url")?,
        is_active: row.try_get("is_active")?,
        people_in_call: row.try_get("people_in_call")?,
        max_participants: row.try_get("max_participants")?,
        participant_ids: participant_ids.into_iter().filter_map(UserId::parse).collect(),
        scheduled_time: row.try_get("scheduled_time")?,
        duration_minutes: row.try_get("duration_minutes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Mock meeting stores for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store whose every call fails.
    #[derive(Debug, Default)]
    pub struct FailingMeetingStore {
        call_count: AtomicUsize,
    }

    impl FailingMeetingStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Get the number of calls made.
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn fail<T>(&self) -> Result<T, StoreError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl MeetingStore for FailingMeetingStore {
        async fn create_if_absent(
            &self,
            _meeting: NewMeeting,
        ) -> Result<(MeetingRecord, bool), StoreError> {
            self.fail()
        }

        async fn get(&self, _code: &RoomCode) -> Result<Option<MeetingRecord>, StoreError> {
            self.fail()
        }

        async fn record_join(&self, _code: &RoomCode, _user_id: &UserId) -> Result<bool, StoreError> {
            self.fail()
        }

        async fn record_leave(&self, _code: &RoomCode) -> Result<bool, StoreError> {
            self.fail()
        }

        async fn delete(&self, _code: &RoomCode) -> Result<bool, StoreError> {
            self.fail()
        }
    }

    /// In-memory store that sleeps before every call.
    #[derive(Debug)]
    pub struct SlowMeetingStore {
        inner: InMemoryMeetingStore,
        delay: Duration,
    }

    impl SlowMeetingStore {
        #[must_use]
        pub fn new(delay: Duration) -> Self {
            Self {
                inner: InMemoryMeetingStore::new(),
                delay,
            }
        }
    }

    #[async_trait]
    impl MeetingStore for SlowMeetingStore {
        async fn create_if_absent(
            &self,
            meeting: NewMeeting,
        ) -> Result<(MeetingRecord, bool), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create_if_absent(meeting).await
        }

        async fn get(&self, code: &RoomCode) -> Result<Option<MeetingRecord>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(code).await
        }

        async fn record_join(&self, code: &RoomCode, user_id: &UserId) -> Result<bool, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.record_join(code, user_id).await
        }

        async fn record_leave(&self, code: &RoomCode) -> Result<bool, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.record_leave(code).await
        }

        async fn delete(&self, code: &RoomCode) -> Result<bool, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.delete(code).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_MEETING_TITLE;

    fn new_meeting(code: &str, host: &str) -> NewMeeting {
        NewMeeting {
            code: RoomCode::parse(code).unwrap(),
            title: DEFAULT_MEETING_TITLE.to_string(),
            description: None,
            host_user_id: UserId::parse(host).unwrap(),
            share_url: format!("http://localhost:5173/call?m={code}"),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryMeetingStore::new();

        let (first, created) = store.create_if_absent(new_meeting("X", "h1")).await.unwrap();
        assert!(created);

        let (second, created) = store.create_if_absent(new_meeting("X", "h2")).await.unwrap();
        assert!(!created);
        assert_eq!(first, second, "existing record returned unchanged");
    }

    #[tokio::test]
    async fn test_join_and_leave_counters() {
        let store = InMemoryMeetingStore::new();
        let code = RoomCode::parse("X").unwrap();
        store.create_if_absent(new_meeting("X", "h1")).await.unwrap();

        assert!(store.record_join(&code, &UserId::parse("u1").unwrap()).await.unwrap());
        assert!(store.record_join(&code, &UserId::parse("h1").unwrap()).await.unwrap());
        let record = store.get(&code).await.unwrap().unwrap();
        assert_eq!(record.people_in_call, 3);
        assert_eq!(record.participant_ids.len(), 2, "set semantics");

        for _ in 0..5 {
            store.record_leave(&code).await.unwrap();
        }
        let record = store.get(&code).await.unwrap().unwrap();
        assert_eq!(record.people_in_call, 0, "never below zero");
    }

    #[tokio::test]
    async fn test_missing_record_updates_nothing() {
        let store = InMemoryMeetingStore::new();
        let code = RoomCode::parse("nope").unwrap();

        assert!(!store.record_join(&code, &UserId::parse("u").unwrap()).await.unwrap());
        assert!(!store.record_leave(&code).await.unwrap());
        assert!(!store.delete(&code).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_store_counts_calls() {
        let store = mock::FailingMeetingStore::new();
        assert!(store.delete(&RoomCode::parse("X").unwrap()).await.is_err());
        assert!(store.record_leave(&RoomCode::parse("X").unwrap()).await.is_err());
        assert_eq!(store.call_count(), 2);
    }
}
