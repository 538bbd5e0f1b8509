#![warn(missing_docs)]

//! streamwarp-net: stream and datagram endpoints.
//!
//! This crate provides the session fabric of the stack:
//! - [`TcpSession`] / [`TcpServer`] / [`TcpClient`]: buffered stream
//!   endpoints with lifecycle events, backpressure and fan-out
//! - [`TlsSession`] / [`TlsServer`] / [`TlsClient`]: the same contract
//!   over a `rustls` record engine
//! - [`UdpSocket`]: a datagram endpoint with optional multicast group
//!   membership
//!
//! Every endpoint is bound to a [`streamwarp_service::Service`] and
//! serializes its callbacks on a strand. Receive regions are only
//! valid for the duration of a callback; callers copy what they keep.

mod client;
mod handler;
mod resolve;
mod server;
mod session;
mod udp;

pub use client::{TcpClient, TlsClient};
pub use handler::{
    TcpServerHandler, TcpSessionHandler, TlsServerHandler, TlsSessionHandler, UdpSocketHandler,
};
pub use server::{TcpServer, TlsServer};
pub use session::{TcpSession, TlsSession};
pub use udp::UdpSocket;
