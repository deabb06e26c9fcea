//! Huddle Relay
//!
//! Entry point for the signaling relay and meeting lifecycle API.

use relay_service::actors::{RelayMetrics, RoomRegistryHandle};
use relay_service::config::{Config, LogFormat};
use relay_service::observability::{metrics::init_metrics_recorder, HealthState};
use relay_service::repositories::{InMemoryMeetingStore, MeetingStore, PgMeetingStore};
use relay_service::routes::{self, AppState};
use relay_service::services::MeetingLifecycle;

use common::secret::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(config.log_format);

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        client_origin = %config.client_origin,
        max_room_participants = config.max_room_participants,
        durable_store = if config.database_url.is_some() { "postgres" } else { "memory" },
        "Starting Huddle relay"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    let store = connect_store(&config).await?;

    let config = Arc::new(config);
    let relay_metrics = RelayMetrics::new();
    let registry = RoomRegistryHandle::new(config.max_room_participants, Arc::clone(&relay_metrics));
    let lifecycle = MeetingLifecycle::new(registry.clone(), store, Arc::clone(&config));

    let health_state = Arc::new(HealthState::new(config.relay_id.clone()));

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let state = Arc::new(AppState {
        lifecycle,
        registry: registry.clone(),
        config: Arc::clone(&config),
        metrics: relay_metrics,
    });
    let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    health_state.set_ready();
    info!("Huddle relay listening on {}", addr);

    let drain_period = config.drain_period;
    let shutdown_health = Arc::clone(&health_state);
    let shutdown_registry = registry.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_health.begin_drain();
        drain(drain_period).await;
        // Close every relay socket so the server can finish.
        shutdown_registry.cancel();
    })
    .await?;

    info!("Huddle relay shutdown complete");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Open the durable store: PostgreSQL when `DATABASE_URL` is set, otherwise
/// process memory.
async fn connect_store(config: &Config) -> Result<Arc<dyn MeetingStore>, Box<dyn std::error::Error>> {
    let Some(database_url) = config.database_url.as_ref() else {
        warn!("DATABASE_URL not set, meeting records are kept in memory");
        return Ok(Arc::new(InMemoryMeetingStore::new()));
    };

    info!("Connecting to database...");
    let url = add_query_timeout(database_url.expose_secret(), config.store_timeout);
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(config.store_timeout)
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;

    info!("Database connection established");
    Ok(Arc::new(PgMeetingStore::new(pool)))
}

/// Adds statement_timeout to the database URL so a query cannot outlive the
/// store timeout on the server side either.
fn add_query_timeout(url: &str, timeout: Duration) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}ms",
        url,
        separator,
        timeout.as_millis()
    )
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn drain(period: Duration) {
    if period.is_zero() {
        info!("Skipping drain period (RELAY_DRAIN_SECONDS=0)");
        return;
    }
    warn!("Draining for {} seconds...", period.as_secs());
    tokio::time::sleep(period).await;
    info!("Drain period complete");
}
