//! Common utilities and types shared across Huddle components.

#![warn(clippy::pedantic)]

/// Module for room, user and connection identifiers
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
