//! HTTP request handlers for the relay service.

pub mod meet;
pub mod metrics;
pub mod signaling;

pub use meet::{create_meeting, end_meeting, join_meeting, leave_meeting, list_participants};
pub use metrics::metrics_handler;
pub use signaling::ws_handler;
