#![warn(missing_docs)]

//! Streamwarp: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports
//! the most commonly used types to build stream servers and clients:
//!
//! - Service, strands and timers (`Service`, `Strand`, `Timer`)
//! - TCP endpoints (`TcpServer`, `TcpClient`, `TcpSession`)
//! - TLS endpoints (`TlsServer`, `TlsClient`, `TlsSession`)
//! - UDP endpoint (`UdpSocket`)
//! - HTTP endpoints (`HttpServer`, `HttpClient`, message builders)
//! - WebSocket endpoints (`WsServer`, `WsClient`)
//! - Core configuration (`Config`) and errors (`Error`)
//!
//! Example
//! ```ignore
//! use std::sync::Arc;
//! use streamwarp::{Config, Service, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};
//!
//! struct EchoSession;
//!
//! impl TcpSessionHandler for EchoSession {
//!     fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
//!         session.send_async(buffer);
//!     }
//! }
//!
//! struct EchoServer;
//!
//! impl TcpServerHandler for EchoServer {
//!     fn create_session(&mut self, _server: &TcpServer) -> Box<dyn TcpSessionHandler> {
//!         Box::new(EchoSession)
//!     }
//! }
//!
//! let service = Service::new(Config::default(), Arc::new(()));
//! service.start();
//! let server = TcpServer::new(&service, "127.0.0.1", 8081, Box::new(EchoServer));
//! server.start();
//! // ... connect clients, exchange data ...
//! server.stop();
//! service.stop();
//! ```

// Core config and errors
pub use streamwarp_core::config::Config;
pub use streamwarp_core::error::{Error, ErrorCategory};
pub use streamwarp_core::id::SessionId;
// Service: reactor, worker pool, strands, timers
pub use streamwarp_service::{Service, ServiceHandler, Strand, Timer};
// Stream and datagram endpoints
pub use streamwarp_net::{
    TcpClient, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler, TlsClient, TlsServer,
    TlsServerHandler, TlsSession, TlsSessionHandler, UdpSocket, UdpSocketHandler,
};
// HTTP layer
pub use streamwarp_http::{
    HttpClient, HttpClientHandler, HttpRequest, HttpResponse, HttpServer, HttpServerHandler,
    HttpSession, HttpSessionHandler,
};
// WebSocket layer
pub use streamwarp_ws::{
    WsClient, WsClientHandler, WsMessage, WsServer, WsServerHandler, WsSession, WsSessionHandler,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, Error, ErrorCategory, HttpClient, HttpRequest, HttpResponse, HttpServer,
        HttpSession, Service, ServiceHandler, SessionId, Strand, TcpClient, TcpServer,
        TcpServerHandler, TcpSession, TcpSessionHandler, Timer, UdpSocket, UdpSocketHandler,
        WsClient, WsClientHandler, WsMessage, WsServer, WsServerHandler, WsSession,
        WsSessionHandler,
    };
}
