//! HTTP server endpoint composed over the TCP layer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tracing::debug;

use streamwarp_core::{error::Error, id::SessionId};
use streamwarp_net::{TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};
use streamwarp_service::Service;

use crate::{message::HttpResponse, parser::RequestParser, HttpRequest};

/// Event sink for one HTTP session.
pub trait HttpSessionHandler: Send {
    /// The underlying transport connected.
    fn on_connected(&mut self, session: &HttpSession) {
        let _ = session;
    }
    /// The underlying transport closed.
    fn on_disconnected(&mut self, session: &HttpSession) {
        let _ = session;
    }
    /// A complete request arrived.
    fn on_received_request(&mut self, session: &HttpSession, request: &HttpRequest) {
        let _ = (session, request);
    }
    /// The inbound byte stream failed to parse as a request; the
    /// session disconnects after this call.
    fn on_received_request_error(&mut self, session: &HttpSession, error: &Error) {
        let _ = (session, error);
    }
    /// An error was attributed to this session.
    fn on_error(&mut self, session: &HttpSession, error: &Error) {
        let _ = (session, error);
    }
}

impl HttpSessionHandler for () {}

/// Event sink for an HTTP server.
pub trait HttpServerHandler: Send {
    /// Supplies the event sink for a newly accepted session.
    fn create_session(&mut self, server: &HttpServer) -> Box<dyn HttpSessionHandler> {
        let _ = server;
        Box::new(())
    }
    /// The server began listening.
    fn on_started(&mut self, server: &HttpServer) {
        let _ = server;
    }
    /// The server stopped listening.
    fn on_stopped(&mut self, server: &HttpServer) {
        let _ = server;
    }
    /// An accepted session connected.
    fn on_connected(&mut self, server: &HttpServer, session: &HttpSession) {
        let _ = (server, session);
    }
    /// An accepted session closed.
    fn on_disconnected(&mut self, server: &HttpServer, session: &HttpSession) {
        let _ = (server, session);
    }
    /// An error was attributed to the server itself.
    fn on_error(&mut self, server: &HttpServer, error: &Error) {
        let _ = (server, error);
    }
}

impl HttpServerHandler for () {}

/// One HTTP session over a TCP transport.
///
/// Responses are queued with [`HttpSession::send_response_async`];
/// when the request asked for `Connection: close`, the transport
/// closes after the queued response drains.
#[derive(Clone)]
pub struct HttpSession {
    transport: TcpSession,
    close_after_send: Arc<AtomicBool>,
}

impl HttpSession {
    /// Stable identifier of the underlying session.
    pub fn id(&self) -> SessionId {
        self.transport.id()
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Serializes and queues a response.
    pub fn send_response_async(&self, response: &HttpResponse) -> bool {
        let queued = self.transport.send_async(&response.to_bytes());
        if queued && self.close_after_send.swap(false, Ordering::AcqRel) {
            self.transport.request_empty_notification();
        }
        queued
    }

    /// Synchronous response send; blocks until the bytes drain.
    /// Illegal on worker threads (returns 0).
    pub fn send_response(&self, response: &HttpResponse) -> usize {
        let bytes = response.to_bytes();
        let sent = self.transport.send(&bytes);
        if sent > 0 && self.close_after_send.swap(false, Ordering::AcqRel) {
            self.transport.disconnect_async();
        }
        sent
    }

    /// Initiates a transport close.
    pub fn disconnect_async(&self) -> bool {
        self.transport.disconnect_async()
    }

    /// Handle to the underlying TCP session.
    pub fn transport(&self) -> &TcpSession {
        &self.transport
    }
}

/// Per-session `Connection: close` flags, keyed by transport id, so
/// handles minted by the server-level hooks drive the same flag as the
/// per-session adapter. Entries leave with the server's
/// `on_disconnected`.
type SessionFlags = Arc<Mutex<HashMap<SessionId, Arc<AtomicBool>>>>;

/// Adapts the byte-stream session events into HTTP message events.
struct HttpSessionAdapter {
    handler: Box<dyn HttpSessionHandler>,
    parser: RequestParser,
    close_after_send: Arc<AtomicBool>,
    flags: SessionFlags,
}

impl HttpSessionAdapter {
    fn session(&self, transport: &TcpSession) -> HttpSession {
        HttpSession {
            transport: transport.clone(),
            close_after_send: self.close_after_send.clone(),
        }
    }
}

impl TcpSessionHandler for HttpSessionAdapter {
    fn on_connected(&mut self, session: &TcpSession) {
        self.flags.lock().unwrap().insert(session.id(), self.close_after_send.clone());
        self.handler.on_connected(&self.session(session));
    }

    fn on_disconnected(&mut self, session: &TcpSession) {
        self.handler.on_disconnected(&self.session(session));
    }

    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        let http_session = self.session(session);
        match self.parser.advance(buffer) {
            Ok(requests) => {
                for request in requests {
                    if !request.keep_alive() {
                        self.close_after_send.store(true, Ordering::Release);
                    }
                    self.handler.on_received_request(&http_session, &request);
                }
            }
            Err(error) => {
                debug!(session = %session.id(), "request parse failed: {}", error);
                match &error {
                    Error::HttpLimitExceeded(_) => self.handler.on_error(&http_session, &error),
                    _ => self.handler.on_received_request_error(&http_session, &error),
                }
                session.disconnect_async();
            }
        }
    }

    fn on_empty(&mut self, session: &TcpSession) {
        // Armed by send_response_async for Connection: close requests.
        session.disconnect_async();
    }

    fn on_error(&mut self, session: &TcpSession, error: &Error) {
        self.handler.on_error(&self.session(session), error);
    }
}

/// Adapts the TCP server events into HTTP server events.
struct HttpServerAdapter {
    handler: Box<dyn HttpServerHandler>,
    flags: SessionFlags,
}

impl HttpServerAdapter {
    fn server(&self, inner: &TcpServer) -> HttpServer {
        HttpServer { inner: inner.clone() }
    }

    /// Mints a handle over the session's live flag. The per-session
    /// adapter registers the flag before any server-level event for
    /// that session fires.
    fn wrap_session(&self, transport: &TcpSession) -> HttpSession {
        let close_after_send = self
            .flags
            .lock()
            .unwrap()
            .get(&transport.id())
            .cloned()
            .unwrap_or_default();
        HttpSession { transport: transport.clone(), close_after_send }
    }
}

impl TcpServerHandler for HttpServerAdapter {
    fn create_session(&mut self, server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        let http_server = self.server(server);
        let config = server.service().config();
        let parser = RequestParser::new(config.http_max_header_size, config.http_max_body_size);
        let handler = self.handler.create_session(&http_server);
        Box::new(HttpSessionAdapter {
            handler,
            parser,
            close_after_send: Arc::new(AtomicBool::new(false)),
            flags: self.flags.clone(),
        })
    }

    fn on_started(&mut self, server: &TcpServer) {
        let server = self.server(server);
        self.handler.on_started(&server);
    }

    fn on_stopped(&mut self, server: &TcpServer) {
        let server = self.server(server);
        self.handler.on_stopped(&server);
    }

    fn on_connected(&mut self, server: &TcpServer, session: &TcpSession) {
        let http_server = self.server(server);
        let http_session = self.wrap_session(session);
        self.handler.on_connected(&http_server, &http_session);
    }

    fn on_disconnected(&mut self, server: &TcpServer, session: &TcpSession) {
        let http_server = self.server(server);
        let http_session = self.wrap_session(session);
        self.handler.on_disconnected(&http_server, &http_session);
        self.flags.lock().unwrap().remove(&session.id());
    }

    fn on_error(&mut self, server: &TcpServer, error: &Error) {
        let server = self.server(server);
        self.handler.on_error(&server, error);
    }
}

/// An HTTP/1.1 server carrying many concurrent sessions over the TCP
/// fabric.
#[derive(Clone)]
pub struct HttpServer {
    inner: TcpServer,
}

impl HttpServer {
    /// Creates a stopped HTTP server bound to `address:port` when
    /// started.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn HttpServerHandler>,
    ) -> Self {
        let adapter = HttpServerAdapter { handler, flags: SessionFlags::default() };
        let inner = TcpServer::new(service, address, port, Box::new(adapter));
        Self { inner }
    }

    /// Binds and starts accepting connections.
    pub fn start(&self) -> bool {
        self.inner.start()
    }

    /// Stops accepting and disconnects every session.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Atomic stop + start.
    pub fn restart(&self) -> bool {
        self.inner.restart()
    }

    /// Whether the server is listening.
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Number of sessions currently connected.
    pub fn clients(&self) -> usize {
        self.inner.clients()
    }

    /// Initiates a graceful close on every session.
    pub fn disconnect_all(&self) -> bool {
        self.inner.disconnect_all()
    }

    /// The underlying TCP server.
    pub fn transport(&self) -> &TcpServer {
        &self.inner
    }
}
