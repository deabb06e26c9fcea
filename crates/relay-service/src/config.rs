//! Relay service configuration.
//!
//! Configuration is loaded from environment variables. The database URL is
//! held as a [`SecretString`] and redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default listener for HTTP and the relay transport.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default base of shareable meeting links.
pub const DEFAULT_CLIENT_ORIGIN: &str = "http://localhost:5173";

/// Default CORS allow-list (the web client's dev and preview origins).
pub const DEFAULT_ALLOWED_ORIGINS: &str =
    "http://localhost:5173,http://localhost:3000,http://127.0.0.1:5173";

/// Default full-mesh capacity per room.
///
/// Every participant holds one peer connection per other participant, so a
/// room of `n` costs `n * (n - 1) / 2` connections and each browser uploads
/// its media `n - 1` times. Eight keeps that at 28 connections.
pub const DEFAULT_MAX_ROOM_PARTICIPANTS: usize = 8;

/// Smallest room in which a call is possible.
pub const MIN_ROOM_PARTICIPANTS: usize = 2;

/// Default bound on a single durable-store call.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Default graceful-shutdown drain period.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Relay service configuration.
#[derive(Clone)]
pub struct Config {
    /// Listener address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Origin of the web client; shareable links are `{origin}/call?m={code}`.
    pub client_origin: String,

    /// CORS allow-list. Empty means any origin (`*`).
    pub allowed_origins: Vec<String>,

    /// PostgreSQL URL for the durable meeting store. `None` selects the
    /// in-memory store.
    pub database_url: Option<SecretString>,

    /// Full-mesh capacity per room, enforced when a connection announces.
    pub max_room_participants: usize,

    /// Upper bound on any single durable-store call.
    pub store_timeout: Duration,

    /// HTTP request timeout.
    pub request_timeout: Duration,

    /// Graceful-shutdown drain period.
    pub drain_period: Duration,

    /// Log output format.
    pub log_format: LogFormat,

    /// Unique identifier for this relay instance, used in logs.
    pub relay_id: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("client_origin", &self.client_origin)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_room_participants", &self.max_room_participants)
            .field("store_timeout", &self.store_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("drain_period", &self.drain_period)
            .field("log_format", &self.log_format)
            .field("relay_id", &self.relay_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Parse an optional positive integer variable.
fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.trim().parse().map_err(|e| {
        invalid(
            name,
            format!("must be a valid positive integer, got '{value_str}': {e}"),
        )
    })?;

    if value == 0 {
        return Err(invalid(name, "must be greater than 0"));
    }

    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for malformed or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for malformed or out-of-range values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let client_origin = vars
            .get("RELAY_CLIENT_ORIGIN")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_ORIGIN.to_string());

        let allowed_origins = parse_origins(
            vars.get("RELAY_ALLOWED_ORIGINS")
                .map_or(DEFAULT_ALLOWED_ORIGINS, String::as_str),
        );

        let database_url = vars
            .get("DATABASE_URL")
            .filter(|s| !s.trim().is_empty())
            .map(|s| SecretString::from(s.clone()));

        let max_room_participants = match vars.get("RELAY_MAX_ROOM_PARTICIPANTS") {
            Some(value_str) => {
                let value: usize = value_str.trim().parse().map_err(|e| {
                    invalid(
                        "RELAY_MAX_ROOM_PARTICIPANTS",
                        format!("must be a valid positive integer, got '{value_str}': {e}"),
                    )
                })?;
                if value < MIN_ROOM_PARTICIPANTS {
                    return Err(invalid(
                        "RELAY_MAX_ROOM_PARTICIPANTS",
                        format!("must be at least {MIN_ROOM_PARTICIPANTS}, got {value}"),
                    ));
                }
                value
            }
            None => DEFAULT_MAX_ROOM_PARTICIPANTS,
        };

        let store_timeout = Duration::from_millis(parse_positive(
            vars,
            "RELAY_STORE_TIMEOUT_MS",
            DEFAULT_STORE_TIMEOUT_MS,
        )?);

        let request_timeout = Duration::from_secs(parse_positive(
            vars,
            "RELAY_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?);

        // Zero is allowed here: it skips the drain period.
        let drain_period = match vars.get("RELAY_DRAIN_SECONDS") {
            Some(value_str) => Duration::from_secs(value_str.trim().parse().map_err(|e| {
                invalid(
                    "RELAY_DRAIN_SECONDS",
                    format!("must be a non-negative integer, got '{value_str}': {e}"),
                )
            })?),
            None => Duration::from_secs(DEFAULT_DRAIN_SECONDS),
        };

        let log_format = match vars.get("RELAY_LOG_FORMAT").map(|s| s.trim()) {
            None | Some("" | "text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(invalid(
                    "RELAY_LOG_FORMAT",
                    format!("must be 'text' or 'json', got '{other}'"),
                ))
            }
        };

        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            client_origin,
            allowed_origins,
            database_url,
            max_room_participants,
            store_timeout,
            request_timeout,
            drain_period,
            log_format,
            relay_id,
        })
    }

    /// Shareable link for a meeting code.
    #[must_use]
    pub fn share_url(&self, code: &str) -> String {
        format!(
            "{}/call?m={}",
            self.client_origin.trim_end_matches('/'),
            urlencoding::encode(code)
        )
    }
}

/// `*` (alone or in the list) means any origin, returned as an empty list.
fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();

    if origins.iter().any(|o| o == "*") {
        Vec::new()
    } else {
        origins
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.client_origin, DEFAULT_CLIENT_ORIGIN);
        assert_eq!(
            config.allowed_origins,
            vec![
                "http://localhost:5173",
                "http://localhost:3000",
                "http://127.0.0.1:5173"
            ]
        );
        assert!(config.database_url.is_none());
        assert_eq!(config.max_room_participants, DEFAULT_MAX_ROOM_PARTICIPANTS);
        assert_eq!(config.store_timeout, Duration::from_millis(2000));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.drain_period, Duration::from_secs(5));
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.relay_id.starts_with("relay-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            (
                "RELAY_CLIENT_ORIGIN".to_string(),
                "https://meet.example.com/".to_string(),
            ),
            (
                "RELAY_ALLOWED_ORIGINS".to_string(),
                "https://meet.example.com".to_string(),
            ),
            (
                "DATABASE_URL".to_string(),
                "postgresql://relay:pw@db/huddle".to_string(),
            ),
            ("RELAY_MAX_ROOM_PARTICIPANTS".to_string(), "4".to_string()),
            ("RELAY_STORE_TIMEOUT_MS".to_string(), "250".to_string()),
            ("RELAY_DRAIN_SECONDS".to_string(), "0".to_string()),
            ("RELAY_LOG_FORMAT".to_string(), "json".to_string()),
            ("RELAY_ID".to_string(), "relay-test-001".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.allowed_origins, vec!["https://meet.example.com"]);
        assert_eq!(
            config.database_url.as_ref().unwrap().expose_secret(),
            "postgresql://relay:pw@db/huddle"
        );
        assert_eq!(config.max_room_participants, 4);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.drain_period, Duration::ZERO);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.relay_id, "relay-test-001");
    }

    #[test]
    fn test_mesh_capacity_rejects_single_participant() {
        let vars = HashMap::from([("RELAY_MAX_ROOM_PARTICIPANTS".to_string(), "1".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { name, reason })
                if name == "RELAY_MAX_ROOM_PARTICIPANTS" && reason.contains("at least 2"))
        );
    }

    #[test]
    fn test_store_timeout_rejects_zero_and_garbage() {
        let vars = HashMap::from([("RELAY_STORE_TIMEOUT_MS".to_string(), "0".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue { reason, .. }) if reason.contains("greater than 0")
        ));

        let vars = HashMap::from([("RELAY_STORE_TIMEOUT_MS".to_string(), "soon".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue { reason, .. }) if reason.contains("valid positive integer")
        ));
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let vars = HashMap::from([("RELAY_LOG_FORMAT".to_string(), "xml".to_string())]);
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_wildcard_origin_allows_any() {
        let vars = HashMap::from([(
            "RELAY_ALLOWED_ORIGINS".to_string(),
            "http://a.test, *".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_share_url_trims_slash_and_encodes_code() {
        let vars = HashMap::from([(
            "RELAY_CLIENT_ORIGIN".to_string(),
            "https://meet.example.com/".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(
            config.share_url("team sync/1"),
            "https://meet.example.com/call?m=team%20sync%2F1"
        );
    }

    #[test]
    fn test_debug_redacts_database_url() {
        let vars = HashMap::from([(
            "DATABASE_URL".to_string(),
            "postgresql://relay:hunter2@db/huddle".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
