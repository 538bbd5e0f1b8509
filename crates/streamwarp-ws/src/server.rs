//! WebSocket server endpoint over the TCP fabric.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use streamwarp_core::{error::Error, id::SessionId};
use streamwarp_http::{HttpRequest, RequestParser};
use streamwarp_net::{TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};
use streamwarp_service::Service;

use crate::{
    endpoint::{Role, WsEngine, WsNotice, WsShared, WsState},
    frame::OpCode,
    handshake,
    WsMessage,
};

/// Event sink for one server-side WebSocket session.
pub trait WsSessionHandler: Send {
    /// The transport connected; the upgrade request is still pending.
    fn on_connected(&mut self, session: &WsSession) {
        let _ = session;
    }
    /// An upgrade request arrived and validated. Return `false` to
    /// reject the connection with `403 Forbidden`.
    fn on_ws_connecting(&mut self, session: &WsSession, request: &HttpRequest) -> bool {
        let _ = (session, request);
        true
    }
    /// The handshake completed; the session is open.
    fn on_ws_connected(&mut self, session: &WsSession, request: &HttpRequest) {
        let _ = (session, request);
    }
    /// A complete (reassembled) application message arrived.
    fn on_ws_received(&mut self, session: &WsSession, message: &WsMessage<'_>) {
        let _ = (session, message);
    }
    /// A ping arrived; a pong with the identical payload was already
    /// queued.
    fn on_ws_ping(&mut self, session: &WsSession, payload: &[u8]) {
        let _ = (session, payload);
    }
    /// A pong arrived.
    fn on_ws_pong(&mut self, session: &WsSession, payload: &[u8]) {
        let _ = (session, payload);
    }
    /// The peer's close frame was processed. Fires at most once.
    fn on_ws_close(&mut self, session: &WsSession, code: u16, reason: &str) {
        let _ = (session, code, reason);
    }
    /// The session left the open state and the transport closed.
    fn on_ws_disconnected(&mut self, session: &WsSession) {
        let _ = session;
    }
    /// An error was attributed to this session.
    fn on_error(&mut self, session: &WsSession, error: &Error) {
        let _ = (session, error);
    }
}

impl WsSessionHandler for () {}

/// Event sink for a WebSocket server.
pub trait WsServerHandler: Send {
    /// Supplies the event sink for a newly accepted session.
    fn create_session(&mut self, server: &WsServer) -> Box<dyn WsSessionHandler> {
        let _ = server;
        Box::new(())
    }
    /// The server began listening.
    fn on_started(&mut self, server: &WsServer) {
        let _ = server;
    }
    /// The server stopped listening.
    fn on_stopped(&mut self, server: &WsServer) {
        let _ = server;
    }
    /// An accepted session connected (before its upgrade).
    fn on_connected(&mut self, server: &WsServer, session: &WsSession) {
        let _ = (server, session);
    }
    /// An accepted session closed and left the session table.
    fn on_disconnected(&mut self, server: &WsServer, session: &WsSession) {
        let _ = (server, session);
    }
    /// An error was attributed to the server itself.
    fn on_error(&mut self, server: &WsServer, error: &Error) {
        let _ = (server, error);
    }
}

impl WsServerHandler for () {}

/// One server-side WebSocket session.
#[derive(Clone)]
pub struct WsSession {
    shared: Arc<WsShared>,
}

impl WsSession {
    /// Stable identifier of the underlying session.
    pub fn id(&self) -> Option<SessionId> {
        self.shared.transport().map(|t| t.id())
    }

    /// Whether the session is in the open state.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Queues a text message, fragmenting above the threshold.
    pub fn send_text_async(&self, text: &str) -> bool {
        self.shared.send_message(OpCode::Text, text.as_bytes())
    }

    /// Queues a binary message, fragmenting above the threshold.
    pub fn send_binary_async(&self, payload: &[u8]) -> bool {
        self.shared.send_message(OpCode::Binary, payload)
    }

    /// Synchronous text send; blocks until the frames drain. Illegal
    /// on worker threads (returns 0).
    pub fn send_text(&self, text: &str) -> usize {
        self.shared.send_message_sync(OpCode::Text, text.as_bytes())
    }

    /// Synchronous binary send; blocks until the frames drain. Illegal
    /// on worker threads (returns 0).
    pub fn send_binary(&self, payload: &[u8]) -> usize {
        self.shared.send_message_sync(OpCode::Binary, payload)
    }

    /// Queues a ping (payload capped at 125 bytes).
    pub fn send_ping_async(&self, payload: &[u8]) -> bool {
        self.shared.send_control(OpCode::Ping, payload)
    }

    /// Queues an unsolicited pong (payload capped at 125 bytes).
    pub fn send_pong_async(&self, payload: &[u8]) -> bool {
        self.shared.send_control(OpCode::Pong, payload)
    }

    /// Initiates the close handshake with `code` and an optional
    /// reason.
    pub fn close_async(&self, code: u16, reason: &str) -> bool {
        self.shared.close_async(code, reason)
    }

    /// Handle to the underlying TCP session, when still attached.
    pub fn transport(&self) -> Option<TcpSession> {
        self.shared.transport()
    }
}

/// Sessions that completed their upgrade, keyed by transport id.
/// Multicast fans out to exactly these.
type OpenSessions = Arc<Mutex<HashMap<SessionId, Arc<WsShared>>>>;

/// Per-session adapter: handshake, then the frame engine.
struct WsServerSessionAdapter {
    handler: Box<dyn WsSessionHandler>,
    parser: RequestParser,
    engine: Option<WsEngine>,
    open: OpenSessions,
}

impl WsServerSessionAdapter {
    fn session(&self) -> Option<WsSession> {
        self.engine.as_ref().map(|engine| WsSession { shared: engine.shared.clone() })
    }

    fn handle_handshake_bytes(&mut self, transport: &TcpSession, buffer: &[u8]) {
        let session = match self.session() {
            Some(session) => session,
            None => return,
        };
        let requests = match self.parser.advance(buffer) {
            Ok(requests) => requests,
            Err(error) => {
                debug!(session = %transport.id(), "upgrade parse failed: {}", error);
                self.handler.on_error(&session, &Error::WsHandshake(error.to_string()));
                transport.disconnect_async();
                return;
            }
        };
        let Some(request) = requests.into_iter().next() else {
            return;
        };
        let sec_key = match handshake::validate_upgrade_request(&request) {
            Ok(sec_key) => sec_key,
            Err(reason) => {
                let error = Error::WsHandshake(reason);
                self.handler.on_error(&session, &error);
                let response = streamwarp_http::HttpResponse::make_error_response(400, "bad upgrade request");
                transport.send_async(&response.to_bytes());
                transport.disconnect_async();
                return;
            }
        };
        if !self.handler.on_ws_connecting(&session, &request) {
            let response = streamwarp_http::HttpResponse::make_error_response(403, "upgrade rejected");
            transport.send_async(&response.to_bytes());
            transport.disconnect_async();
            return;
        }
        let response = handshake::make_upgrade_response(&request, &sec_key);
        transport.send_async(&response.to_bytes());
        if let Some(engine) = self.engine.as_ref() {
            engine.shared.set_state(WsState::Open);
            self.open.lock().unwrap().insert(transport.id(), engine.shared.clone());
        }
        self.handler.on_ws_connected(&session, &request);
        // Frames may already trail the upgrade request.
        let leftover = self.parser.take_buffered();
        if !leftover.is_empty() {
            self.handle_open_bytes(&leftover);
        }
    }

    fn handle_open_bytes(&mut self, buffer: &[u8]) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let session = WsSession { shared: engine.shared.clone() };
        let handler = &mut self.handler;
        engine.handle_frames(buffer, |notice| match notice {
            WsNotice::Received(message) => handler.on_ws_received(&session, &message),
            WsNotice::Ping(payload) => handler.on_ws_ping(&session, payload),
            WsNotice::Pong(payload) => handler.on_ws_pong(&session, payload),
            WsNotice::Close { code, reason } => handler.on_ws_close(&session, code, reason),
            WsNotice::Failed { error } => handler.on_error(&session, &error),
        });
    }
}

impl TcpSessionHandler for WsServerSessionAdapter {
    fn on_connected(&mut self, session: &TcpSession) {
        let shared = WsShared::new(session.clone(), Role::Server, session.service().config());
        self.engine = Some(WsEngine::new(shared));
        if let Some(ws_session) = self.session() {
            self.handler.on_connected(&ws_session);
        }
    }

    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        let state = match self.engine.as_ref() {
            Some(engine) => engine.shared.state(),
            None => return,
        };
        match state {
            WsState::Handshake => self.handle_handshake_bytes(session, buffer),
            WsState::Open | WsState::Closing => self.handle_open_bytes(buffer),
            WsState::Closed => {}
        }
    }

    fn on_disconnected(&mut self, session: &TcpSession) {
        self.open.lock().unwrap().remove(&session.id());
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        let shared = engine.shared.clone();
        shared.cancel_close_timer();
        let session = WsSession { shared: shared.clone() };
        if shared.take_close_timed_out() {
            self.handler.on_error(&session, &Error::WsCloseTimeout);
        }
        let state = shared.state();
        shared.set_state(WsState::Closed);
        if state == WsState::Open || state == WsState::Closing {
            self.handler.on_ws_disconnected(&session);
        }
        shared.clear_transport();
    }

    fn on_error(&mut self, _session: &TcpSession, error: &Error) {
        if let Some(session) = self.session() {
            self.handler.on_error(&session, error);
        }
    }
}

/// Adapts the TCP server events into WebSocket server events.
struct WsServerAdapter {
    handler: Box<dyn WsServerHandler>,
    open: OpenSessions,
}

impl WsServerAdapter {
    fn server(&self, inner: &TcpServer) -> WsServer {
        WsServer { inner: inner.clone(), open: self.open.clone() }
    }

    fn wrap_session(&self, session: &TcpSession) -> WsSession {
        if let Some(shared) = self.open.lock().unwrap().get(&session.id()) {
            return WsSession { shared: shared.clone() };
        }
        // Not upgraded yet: a transient handle for join/leave
        // notifications. Message operations require the open state.
        let shared = WsShared::new(session.clone(), Role::Server, session.service().config());
        WsSession { shared }
    }
}

impl TcpServerHandler for WsServerAdapter {
    fn create_session(&mut self, server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        let ws_server = self.server(server);
        let config = server.service().config();
        let handler = self.handler.create_session(&ws_server);
        Box::new(WsServerSessionAdapter {
            handler,
            parser: RequestParser::new(config.http_max_header_size, config.http_max_body_size),
            engine: None,
            open: self.open.clone(),
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
        let server = self.server(server);
        let session = self.wrap_session(session);
        self.handler.on_connected(&server, &session);
    }

    fn on_disconnected(&mut self, server: &TcpServer, session: &TcpSession) {
        let server = self.server(server);
        let session = self.wrap_session(session);
        self.handler.on_disconnected(&server, &session);
    }

    fn on_error(&mut self, server: &TcpServer, error: &Error) {
        let server = self.server(server);
        self.handler.on_error(&server, error);
    }
}

/// A WebSocket server carrying many concurrent sessions over the TCP
/// fabric.
#[derive(Clone)]
pub struct WsServer {
    inner: TcpServer,
    open: OpenSessions,
}

impl WsServer {
    /// Creates a stopped WebSocket server bound to `address:port` when
    /// started.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn WsServerHandler>,
    ) -> Self {
        let open: OpenSessions = Arc::new(Mutex::new(HashMap::new()));
        let adapter = WsServerAdapter { handler, open: open.clone() };
        let inner = TcpServer::new(service, address, port, Box::new(adapter));
        Self { inner, open }
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

    /// Number of transport sessions currently connected.
    pub fn clients(&self) -> usize {
        self.inner.clients()
    }

    /// Sends a text message to every open session. Server frames are
    /// unmasked, so one encoding fans out to all sessions; sessions
    /// still in their handshake are skipped.
    pub fn multicast_text(&self, text: &str) -> bool {
        self.multicast_frame(OpCode::Text, text.as_bytes())
    }

    /// Sends a binary message to every open session.
    pub fn multicast_binary(&self, payload: &[u8]) -> bool {
        self.multicast_frame(OpCode::Binary, payload)
    }

    /// Initiates a graceful close on every session.
    pub fn disconnect_all(&self) -> bool {
        self.inner.disconnect_all()
    }

    /// Aggregate payload bytes sent across all sessions.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent()
    }

    /// Aggregate payload bytes received across all sessions.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }

    /// The underlying TCP server.
    pub fn transport(&self) -> &TcpServer {
        &self.inner
    }

    fn multicast_frame(&self, opcode: OpCode, payload: &[u8]) -> bool {
        if !self.inner.is_started() {
            return false;
        }
        let snapshot: Vec<Arc<WsShared>> =
            self.open.lock().unwrap().values().cloned().collect();
        let mut encoded: Option<Vec<u8>> = None;
        for shared in snapshot {
            let bytes = encoded.get_or_insert_with(|| shared.encode_message(opcode, payload));
            if let Some(transport) = shared.transport() {
                transport.send_async(bytes);
            }
        }
        true
    }
}
