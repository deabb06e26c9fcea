//! HTTP routes for the relay service.
//!
//! Defines the Axum router and application state.

use crate::actors::{RelayMetrics, RoomRegistryHandle};
use crate::config::Config;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::observability::{health_router, HealthState};
use crate::services::MeetingLifecycle;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Meeting lifecycle coordinator behind `/meet`.
    pub lifecycle: MeetingLifecycle,

    /// Room registry, shared with every relay connection.
    pub registry: RoomRegistryHandle,

    /// Service configuration.
    pub config: Arc<Config>,

    /// Actor-level gauges and counters.
    pub metrics: Arc<RelayMetrics>,
}

/// Build the application routes.
///
/// - `/meet/*` - Meeting lifecycle (create, join, leave, end, list)
/// - `/ws` - Signaling relay WebSocket
/// - `/health`, `/ready` - Probes
/// - `/metrics` - Prometheus scrape
///
/// `/ws` is excluded from the request timeout; a relay connection lives as
/// long as its tab.
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    let request_timeout = state.config.request_timeout;

    let meet_routes = Router::new()
        .route("/meet/create", post(handlers::create_meeting))
        .route("/meet/join", post(handlers::join_meeting))
        .route("/meet/leave", post(handlers::leave_meeting))
        .route("/meet/end", post(handlers::end_meeting))
        .route("/meet/:room_code", get(handlers::list_participants))
        .route("/meet/:room_code/", get(handlers::list_participants))
        .with_state(Arc::clone(&state))
        .layer(TimeoutLayer::new(request_timeout));

    let relay_routes = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. CorsLayer - Answer preflights, tag responses
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    meet_routes
        .merge(relay_routes)
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}

/// CORS for the web client. An empty allow-list means any origin.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if allowed_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "relay.routes", origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(origins))
}
