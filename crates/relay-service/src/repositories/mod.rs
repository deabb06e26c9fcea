//! Repository layer for the relay service.

pub mod meetings;

pub use meetings::{InMemoryMeetingStore, MeetingStore, PgMeetingStore, StoreError};
