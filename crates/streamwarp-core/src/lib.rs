#![warn(missing_docs)]

//! streamwarp-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all layers:
//! - Configuration types
//! - Error handling
//! - Buffer regions (double-buffered send region, growable receive region)
//! - Session identifiers
//!
//! Protocol- and transport-specific logic lives in specialized crates:
//! - `streamwarp-service`: reactor, worker pool, strands, timers
//! - `streamwarp-net`: TCP/TLS sessions, servers, clients and UDP endpoints
//! - `streamwarp-http`: HTTP/1.1 messages and endpoints
//! - `streamwarp-ws`: WebSocket framing, handshake and endpoints

/// Buffer regions used by stream sessions.
pub mod buffer;
/// Configuration options to tune endpoint and runtime behavior.
pub mod config;
/// Error types and results.
pub mod error;
/// Stable session identifiers.
pub mod id;
