//! Embedder-facing event sinks for stream and datagram endpoints.
//!
//! Each endpoint accepts a boxed handler at construction and invokes
//! it on the endpoint's strand, so implementations get `&mut self`
//! without further locking. Every method has a no-op default; `()`
//! implements the session traits for endpoints that only move bytes.

use std::net::SocketAddr;

use streamwarp_core::error::Error;

use crate::{
    session::{TcpSession, TlsSession},
    server::{TcpServer, TlsServer},
    udp::UdpSocket,
};

/// Event sink for one TCP session (accepted or client-side).
pub trait TcpSessionHandler: Send {
    /// A client session is about to initiate its connection.
    fn on_connecting(&mut self, session: &TcpSession) {
        let _ = session;
    }
    /// The session transitioned to connected.
    fn on_connected(&mut self, session: &TcpSession) {
        let _ = session;
    }
    /// The session is about to close.
    fn on_disconnecting(&mut self, session: &TcpSession) {
        let _ = session;
    }
    /// The session closed. Fires exactly once per `on_connected`.
    fn on_disconnected(&mut self, session: &TcpSession) {
        let _ = session;
    }
    /// Inbound bytes are available. `buffer` is only valid within the
    /// call; copy what outlives it.
    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        let _ = (session, buffer);
    }
    /// A flush to the kernel completed. `sent` is the bytes written by
    /// this flush, `pending` what remains queued.
    fn on_sent(&mut self, session: &TcpSession, sent: usize, pending: usize) {
        let _ = (session, sent, pending);
    }
    /// The send region drained after a requested empty notification.
    fn on_empty(&mut self, session: &TcpSession) {
        let _ = session;
    }
    /// An error was attributed to this session.
    fn on_error(&mut self, session: &TcpSession, error: &Error) {
        let _ = (session, error);
    }
}

impl TcpSessionHandler for () {}

/// Event sink for a TCP server.
pub trait TcpServerHandler: Send {
    /// Supplies the event sink for a newly accepted session.
    fn create_session(&mut self, server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        let _ = server;
        Box::new(())
    }
    /// The server began listening.
    fn on_started(&mut self, server: &TcpServer) {
        let _ = server;
    }
    /// The server stopped listening.
    fn on_stopped(&mut self, server: &TcpServer) {
        let _ = server;
    }
    /// An accepted session finished connecting.
    fn on_connected(&mut self, server: &TcpServer, session: &TcpSession) {
        let _ = (server, session);
    }
    /// An accepted session closed and left the session table.
    fn on_disconnected(&mut self, server: &TcpServer, session: &TcpSession) {
        let _ = (server, session);
    }
    /// An error was attributed to the server itself (not a session).
    fn on_error(&mut self, server: &TcpServer, error: &Error) {
        let _ = (server, error);
    }
}

impl TcpServerHandler for () {}

/// Event sink for one TLS session. Same contract as
/// [`TcpSessionHandler`] plus the handshake notification.
pub trait TlsSessionHandler: Send {
    /// A client session is about to initiate its connection.
    fn on_connecting(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// The TLS handshake completed. Fires immediately before
    /// `on_connected`.
    fn on_handshaked(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// The session transitioned to connected (handshake included).
    fn on_connected(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// The session is about to close.
    fn on_disconnecting(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// The session closed. Fires exactly once per `on_connected`.
    fn on_disconnected(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// Decrypted inbound bytes are available. `buffer` is only valid
    /// within the call.
    fn on_received(&mut self, session: &TlsSession, buffer: &[u8]) {
        let _ = (session, buffer);
    }
    /// A flush completed; sizes count plaintext bytes.
    fn on_sent(&mut self, session: &TlsSession, sent: usize, pending: usize) {
        let _ = (session, sent, pending);
    }
    /// The send region drained after a requested empty notification.
    fn on_empty(&mut self, session: &TlsSession) {
        let _ = session;
    }
    /// An error was attributed to this session.
    fn on_error(&mut self, session: &TlsSession, error: &Error) {
        let _ = (session, error);
    }
}

impl TlsSessionHandler for () {}

/// Event sink for a TLS server.
pub trait TlsServerHandler: Send {
    /// Supplies the event sink for a newly accepted session.
    fn create_session(&mut self, server: &TlsServer) -> Box<dyn TlsSessionHandler> {
        let _ = server;
        Box::new(())
    }
    /// The server began listening.
    fn on_started(&mut self, server: &TlsServer) {
        let _ = server;
    }
    /// The server stopped listening.
    fn on_stopped(&mut self, server: &TlsServer) {
        let _ = server;
    }
    /// An accepted session completed its handshake.
    fn on_connected(&mut self, server: &TlsServer, session: &TlsSession) {
        let _ = (server, session);
    }
    /// An accepted session closed and left the session table.
    fn on_disconnected(&mut self, server: &TlsServer, session: &TlsSession) {
        let _ = (server, session);
    }
    /// An error was attributed to the server itself (not a session).
    fn on_error(&mut self, server: &TlsServer, error: &Error) {
        let _ = (server, error);
    }
}

impl TlsServerHandler for () {}

/// Event sink for a UDP endpoint.
pub trait UdpSocketHandler: Send {
    /// The socket was bound and registered.
    fn on_started(&mut self, socket: &UdpSocket) {
        let _ = socket;
    }
    /// The socket was closed.
    fn on_stopped(&mut self, socket: &UdpSocket) {
        let _ = socket;
    }
    /// A datagram arrived. `buffer` is only valid within the call.
    fn on_received(&mut self, socket: &UdpSocket, endpoint: SocketAddr, buffer: &[u8]) {
        let _ = (socket, endpoint, buffer);
    }
    /// A queued datagram was handed to the kernel.
    fn on_sent(&mut self, socket: &UdpSocket, endpoint: SocketAddr, sent: usize) {
        let _ = (socket, endpoint, sent);
    }
    /// An error was attributed to this socket.
    fn on_error(&mut self, socket: &UdpSocket, error: &Error) {
        let _ = (socket, error);
    }
}

impl UdpSocketHandler for () {}
