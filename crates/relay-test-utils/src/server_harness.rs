//! Test server harness for E2E testing
//!
//! Provides `TestRelayServer` for spawning real relay instances in tests.

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_service::actors::{RelayMetrics, RoomRegistryHandle};
use relay_service::config::Config;
use relay_service::observability::HealthState;
use relay_service::repositories::{InMemoryMeetingStore, MeetingStore};
use relay_service::routes::{self, AppState};
use relay_service::services::MeetingLifecycle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the relay in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> anyhow::Result<()> {
///     let server = TestRelayServer::spawn().await?;
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    config: Arc<Config>,
    registry: RoomRegistryHandle,
    health: Arc<HealthState>,
    metrics: Arc<RelayMetrics>,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a relay with default configuration and an in-memory store.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(HashMap::new(), Arc::new(InMemoryMeetingStore::new())).await
    }

    /// Spawn a relay with extra environment variables and a specific store.
    ///
    /// # Arguments
    /// * `vars` - Overrides merged over the test defaults
    /// * `store` - Durable store backend (e.g. a failing mock)
    pub async fn spawn_with(
        vars: HashMap<String, String>,
        store: Arc<dyn MeetingStore>,
    ) -> Result<Self, anyhow::Error> {
        let mut all_vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("RELAY_ID".to_string(), "relay-test".to_string()),
            ("RELAY_DRAIN_SECONDS".to_string(), "0".to_string()),
        ]);
        all_vars.extend(vars);

        let config = Arc::new(
            Config::from_vars(&all_vars)
                .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?,
        );

        let metrics = RelayMetrics::new();
        let registry = RoomRegistryHandle::new(config.max_room_participants, Arc::clone(&metrics));
        let lifecycle = MeetingLifecycle::new(registry.clone(), store, Arc::clone(&config));
        let state = Arc::new(AppState {
            lifecycle,
            registry: registry.clone(),
            config: Arc::clone(&config),
            metrics: Arc::clone(&metrics),
        });

        let health = Arc::new(HealthState::new(config.relay_id.clone()));
        health.set_ready();

        // A recorder that is never installed globally; tests may spawn many servers.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let app = routes::build_routes(state, Arc::clone(&health), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            registry,
            health,
            metrics,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the relay WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry handle, for asserting membership without going through HTTP.
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.registry.cancel();
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestRelayServer::spawn().await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));
        assert!(server.ws_url().ends_with("/ws"));

        let response = reqwest::get(format!("{}/health", server.url())).await?;
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["status"], "alive");
        assert_eq!(body["relayId"], "relay-test");

        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_with_overrides_config() -> Result<(), anyhow::Error> {
        let server = TestRelayServer::spawn_with(
            HashMap::from([("RELAY_MAX_ROOM_PARTICIPANTS".to_string(), "2".to_string())]),
            Arc::new(InMemoryMeetingStore::new()),
        )
        .await?;

        assert_eq!(server.config().max_room_participants, 2);
        assert!(server.addr().ip().is_loopback());
        Ok(())
    }
}
