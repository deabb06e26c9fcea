//! Huddle Relay Service Library
//!
//! The control plane of a peer-to-peer call: it tracks who is in which room,
//! relays the offer/answer/candidate messages two browsers need to connect
//! directly, and mirrors membership into an advisory meeting record. It never
//! sees media.
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/meet.rs -> services/lifecycle.rs -> actors/registry.rs
//!                                                            -> repositories/meetings.rs
//!               -> handlers/signaling.rs -> actors/connection.rs -> actors/room.rs
//! ```
//!
//! The room registry (one actor per room) is the only source of truth for
//! membership. The durable store is consulted by the lifecycle coordinator
//! alone and never gates a relay or membership operation.
//!
//! # Modules
//!
//! - `actors` - Registry, room and connection actors
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP and WebSocket handlers
//! - `middleware` - HTTP metrics middleware
//! - `models` - Membership views, meeting record, request/response bodies
//! - `observability` - Prometheus metrics and health probes
//! - `repositories` - Durable meeting store backends
//! - `routes` - Axum router setup
//! - `services` - Meeting lifecycle coordinator

pub mod actors;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod services;
