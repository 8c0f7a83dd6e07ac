//! Shared types and helpers for the stream controller crates.

#![warn(clippy::pedantic)]

/// Caller-supplied deadlines for blocking operations
pub mod deadline;

/// Shared identifier types
pub mod types;

/// Environment variable parsing helpers
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
