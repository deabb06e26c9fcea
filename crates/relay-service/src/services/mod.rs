//! Service layer for the relay.

pub mod lifecycle;

pub use lifecycle::MeetingLifecycle;
