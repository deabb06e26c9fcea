//! WebSocket upgrade for the signaling relay.
//!
//! `GET /ws` upgrades and hands the socket to a fresh `ConnectionActor`,
//! which owns it until the client disconnects or the relay shuts down. No
//! authentication happens here; identity is whatever the client announces.

use crate::actors::ConnectionActor;
use crate::routes::AppState;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use signaling_protocol::MAX_FRAME_BYTES;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Handler for GET /ws
#[instrument(skip_all, name = "relay.signaling.upgrade")]
pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    if state.registry.is_cancelled() {
        debug!(target: "relay.handlers.signaling", "Refusing upgrade during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let actor = ConnectionActor::new(state.registry.clone(), Arc::clone(&state.metrics));
    debug!(
        target: "relay.handlers.signaling",
        connection_id = %actor.connection_id(),
        "Upgrading relay connection"
    );

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| actor.run(socket))
}
