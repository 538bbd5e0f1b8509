#![warn(missing_docs)]

//! streamwarp-ws: RFC 6455 WebSocket endpoints.
//!
//! This crate layers the WebSocket protocol on top of the TCP session
//! fabric:
//! - [`frame`]: framing codec (opcode flags, 7/16/64-bit lengths,
//!   masking)
//! - [`handshake`]: HTTP/1.1 upgrade (nonce, accept-key derivation,
//!   request/response validation)
//! - [`WsServer`] / [`WsSession`]: server endpoint with per-session
//!   event sinks and text/binary multicast
//! - [`WsClient`]: client endpoint; every outbound frame is masked
//!   with a fresh key
//!
//! Inbound messages are reassembled from fragments before delivery;
//! control frames follow the RFC rules (ping answered with an
//! identical-payload pong, close handshake guarded by a timer).

pub mod frame;
pub mod handshake;

mod client;
mod endpoint;
mod server;

pub use client::{WsClient, WsClientHandler};
pub use endpoint::WsMessage;
pub use server::{WsServer, WsServerHandler, WsSession, WsSessionHandler};
