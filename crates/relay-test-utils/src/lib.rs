//! # Relay Test Utilities
//!
//! Shared test utilities for the relay service.
//!
//! This crate provides:
//! - Server test harness (`TestRelayServer`: real router on an ephemeral port)
//! - WebSocket client (`TestRelayClient`: typed send, timeout-bounded receive)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestRelayServer::spawn().await?;
//!     let mut alice = TestRelayClient::connect(&server).await?;
//!     alice.join("R1", "alice", Some("Alice")).await?;
//!     alice.expect_silence().await?;
//!     Ok(())
//! }
//! ```

pub mod relay_client;
pub mod server_harness;

// Re-export commonly used items
pub use relay_client::*;
pub use server_harness::*;
