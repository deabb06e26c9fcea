//! Secret types for configuration values that must never reach a log line.
//!
//! Re-exports [`secrecy`]'s wrappers. Their `Debug` output is redacted, so a
//! config struct that derives or hand-writes `Debug` cannot leak a database
//! password through `{:?}` or a tracing field. Reading the value requires an
//! explicit `expose_secret()` call at the point of use.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("postgresql://relay:hunter2@db/huddle");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("postgresql://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
