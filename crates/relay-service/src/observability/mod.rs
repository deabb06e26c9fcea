//! Observability for the relay service.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `relay_rooms_active` | gauge | |
//! | `relay_connections_active` | gauge | |
//! | `relay_participants_active` | gauge | |
//! | `relay_actor_mailbox_depth` | gauge | `actor_type` |
//! | `relay_signals_forwarded_total` | counter | `mode`, `kind` |
//! | `relay_signals_dropped_total` | counter | `reason` |
//! | `relay_membership_events_total` | counter | `event` |
//! | `relay_store_failures_total` | counter | `operation` |
//! | `relay_messages_dropped_total` | counter | `actor_type` |
//! | `relay_actor_panics_total` | counter | `actor_type` |
//! | `relay_store_latency_seconds` | histogram | `operation`, `status` |
//! | `relay_http_requests_total` | counter | `method`, `endpoint`, `status_code` |
//! | `relay_http_request_duration_seconds` | histogram | `method`, `endpoint`, `status` |
//!
//! Room codes, user ids and connection ids never appear as labels; they go
//! into tracing span fields only.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
