//! Liveness and readiness probes.
//!
//! - `GET /health`: 200 while the process runs.
//! - `GET /ready`: 200 once the registry is accepting rooms, 503 before
//!   startup completes and after shutdown begins draining.
//!
//! Both return a small JSON body carrying the relay id so a load balancer log
//! shows which instance answered.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state shared between `main` and the health router.
#[derive(Debug)]
pub struct HealthState {
    relay_id: String,
    live: AtomicBool,
    ready: AtomicBool,
    draining: AtomicBool,
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness; new traffic should go elsewhere while
    /// existing rooms drain.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeBody {
    status: &'static str,
    relay_id: String,
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    let (status, label) = if state.is_live() {
        (StatusCode::OK, "alive")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "dead")
    };
    (
        status,
        Json(ProbeBody {
            status: label,
            relay_id: state.relay_id.clone(),
        }),
    )
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ProbeBody>) {
    let (status, label) = if state.is_ready() {
        (StatusCode::OK, "ready")
    } else if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    (
        status,
        Json(ProbeBody {
            status: label,
            relay_id: state.relay_id.clone(),
        }),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn probe(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_drain_clears_readiness() {
        let state = HealthState::new("relay-a");
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.set_ready();
        assert!(state.is_ready());

        state.begin_drain();
        assert!(!state.is_ready());
        state.set_ready();
        assert!(!state.is_ready(), "draining wins over a late set_ready");
    }

    #[tokio::test]
    async fn test_liveness_reports_relay_id() {
        let state = Arc::new(HealthState::new("relay-a"));
        let (status, body) = probe(health_router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
        assert_eq!(body["relayId"], "relay-a");
    }

    #[tokio::test]
    async fn test_readiness_lifecycle() {
        let state = Arc::new(HealthState::new("relay-a"));

        let (status, body) = probe(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "starting");

        state.set_ready();
        let (status, body) = probe(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        state.begin_drain();
        let (status, body) = probe(health_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "draining");
    }
}
