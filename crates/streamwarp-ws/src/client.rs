//! WebSocket client endpoint over the TCP fabric.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use streamwarp_core::error::Error;
use streamwarp_http::{HttpRequest, HttpResponse, ResponseParser};
use streamwarp_net::{TcpClient, TcpSession, TcpSessionHandler};
use streamwarp_service::Service;

use crate::{
    endpoint::{Role, WsEngine, WsNotice, WsShared, WsState},
    frame::OpCode,
    handshake,
    WsMessage,
};

/// Event sink for a WebSocket client.
pub trait WsClientHandler: Send {
    /// The transport connected; the upgrade request goes out next.
    fn on_connected(&mut self, client: &WsClient) {
        let _ = client;
    }
    /// The upgrade request is about to be sent; adjust the target,
    /// `Origin`, `Sec-WebSocket-Protocol` or other headers here.
    fn on_ws_connecting(&mut self, client: &WsClient, request: &mut HttpRequest) {
        let _ = (client, request);
    }
    /// The server accepted the upgrade; the session is open.
    fn on_ws_connected(&mut self, client: &WsClient, response: &HttpResponse) {
        let _ = (client, response);
    }
    /// A complete (reassembled) application message arrived.
    fn on_ws_received(&mut self, client: &WsClient, message: &WsMessage<'_>) {
        let _ = (client, message);
    }
    /// A ping arrived; a pong with the identical payload was already
    /// queued.
    fn on_ws_ping(&mut self, client: &WsClient, payload: &[u8]) {
        let _ = (client, payload);
    }
    /// A pong arrived.
    fn on_ws_pong(&mut self, client: &WsClient, payload: &[u8]) {
        let _ = (client, payload);
    }
    /// The server's close frame was processed. Fires at most once.
    fn on_ws_close(&mut self, client: &WsClient, code: u16, reason: &str) {
        let _ = (client, code, reason);
    }
    /// The session left the open state and the transport closed.
    fn on_ws_disconnected(&mut self, client: &WsClient) {
        let _ = client;
    }
    /// An error was attributed to this client.
    fn on_error(&mut self, client: &WsClient, error: &Error) {
        let _ = (client, error);
    }
}

impl WsClientHandler for () {}

struct WsClientAdapter {
    handler: Box<dyn WsClientHandler>,
    parser: ResponseParser,
    engine: Option<WsEngine>,
    sec_key: String,
    client: Arc<OnceLock<WsClientShared>>,
}

/// Pieces the adapter needs to mint `WsClient` handles.
#[derive(Clone)]
struct WsClientShared {
    inner: TcpClient,
    ws: Arc<Mutex<Option<Arc<WsShared>>>>,
}

impl WsClientAdapter {
    fn client(&self) -> Option<WsClient> {
        self.client.get().map(|shared| WsClient {
            inner: shared.inner.clone(),
            ws: shared.ws.clone(),
        })
    }

    fn handle_handshake_bytes(&mut self, transport: &TcpSession, buffer: &[u8]) {
        let Some(client) = self.client() else {
            return;
        };
        let responses = match self.parser.advance(buffer) {
            Ok(responses) => responses,
            Err(error) => {
                debug!("upgrade response parse failed: {}", error);
                self.handler.on_error(&client, &Error::WsHandshake(error.to_string()));
                transport.disconnect_async();
                return;
            }
        };
        let Some(response) = responses.into_iter().next() else {
            return;
        };
        if let Err(reason) = handshake::validate_upgrade_response(&response, &self.sec_key) {
            self.handler.on_error(&client, &Error::WsHandshake(reason));
            transport.disconnect_async();
            return;
        }
        if let Some(engine) = self.engine.as_ref() {
            engine.shared.set_state(WsState::Open);
        }
        self.handler.on_ws_connected(&client, &response);
        // The server may pipeline frames directly after the 101.
        let leftover = self.parser.take_buffered();
        if !leftover.is_empty() {
            self.handle_open_bytes(&leftover);
        }
    }

    fn handle_open_bytes(&mut self, buffer: &[u8]) {
        let Some(client) = self.client() else {
            return;
        };
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let handler = &mut self.handler;
        engine.handle_frames(buffer, |notice| match notice {
            WsNotice::Received(message) => handler.on_ws_received(&client, &message),
            WsNotice::Ping(payload) => handler.on_ws_ping(&client, payload),
            WsNotice::Pong(payload) => handler.on_ws_pong(&client, payload),
            WsNotice::Close { code, reason } => handler.on_ws_close(&client, code, reason),
            WsNotice::Failed { error } => handler.on_error(&client, &error),
        });
    }
}

impl TcpSessionHandler for WsClientAdapter {
    fn on_connected(&mut self, session: &TcpSession) {
        let shared = WsShared::new(session.clone(), Role::Client, session.service().config());
        self.engine = Some(WsEngine::new(shared.clone()));
        self.parser = ResponseParser::new(
            session.service().config().http_max_header_size,
            session.service().config().http_max_body_size,
        );
        let Some(client) = self.client() else {
            return;
        };
        *client.ws.lock().unwrap() = Some(shared);
        self.handler.on_connected(&client);

        // Build and send the upgrade request. The Host header carries
        // the configured name, not the resolved address, so name-based
        // routing on the server keeps working.
        self.sec_key = handshake::new_sec_key();
        let host = format!("{}:{}", client.inner.address(), client.inner.port());
        let mut request = handshake::make_upgrade_request(&host, "/", &self.sec_key);
        self.handler.on_ws_connecting(&client, &mut request);
        session.send_async(&request.to_bytes());
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

    fn on_disconnected(&mut self, _session: &TcpSession) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let shared = engine.shared;
        shared.cancel_close_timer();
        let Some(client) = self.client() else {
            shared.clear_transport();
            return;
        };
        if shared.take_close_timed_out() {
            self.handler.on_error(&client, &Error::WsCloseTimeout);
        }
        let state = shared.state();
        shared.set_state(WsState::Closed);
        if state == WsState::Open || state == WsState::Closing {
            self.handler.on_ws_disconnected(&client);
        }
        shared.clear_transport();
        *client.ws.lock().unwrap() = None;
    }

    fn on_error(&mut self, _session: &TcpSession, error: &Error) {
        if let Some(client) = self.client() {
            self.handler.on_error(&client, error);
        }
    }
}

/// A WebSocket client endpoint. Every outbound frame is masked with a
/// fresh random key.
#[derive(Clone)]
pub struct WsClient {
    inner: TcpClient,
    ws: Arc<Mutex<Option<Arc<WsShared>>>>,
}

impl WsClient {
    /// Creates a disconnected client for `address:port`.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn WsClientHandler>,
    ) -> Self {
        let config = service.config();
        let slot: Arc<OnceLock<WsClientShared>> = Arc::new(OnceLock::new());
        let adapter = WsClientAdapter {
            handler,
            parser: ResponseParser::new(config.http_max_header_size, config.http_max_body_size),
            engine: None,
            sec_key: String::new(),
            client: slot.clone(),
        };
        let inner = TcpClient::new(service, address, port, Box::new(adapter));
        let ws = Arc::new(Mutex::new(None));
        let _ = slot.set(WsClientShared { inner: inner.clone(), ws: ws.clone() });
        Self { inner, ws }
    }

    /// Initiates the connection and, once connected, the upgrade.
    pub fn connect_async(&self) -> bool {
        self.inner.connect_async()
    }

    /// Synchronous transport connect; the upgrade completes
    /// asynchronously afterwards. Illegal on worker threads.
    pub fn connect(&self) -> bool {
        self.inner.connect()
    }

    /// Initiates a transport close without a close handshake.
    pub fn disconnect_async(&self) -> bool {
        self.inner.disconnect_async()
    }

    /// Synchronous transport close. Illegal on worker threads, where
    /// it only initiates.
    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }

    /// Whether the WebSocket session is open (handshake completed).
    pub fn is_open(&self) -> bool {
        self.ws.lock().unwrap().as_ref().is_some_and(|ws| ws.is_open())
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Queues a text message, fragmenting above the threshold.
    pub fn send_text_async(&self, text: &str) -> bool {
        self.with_ws(|ws| ws.send_message(OpCode::Text, text.as_bytes()))
    }

    /// Queues a binary message, fragmenting above the threshold.
    pub fn send_binary_async(&self, payload: &[u8]) -> bool {
        self.with_ws(|ws| ws.send_message(OpCode::Binary, payload))
    }

    /// Synchronous text send; blocks until the frames drain. Illegal
    /// on worker threads (returns 0).
    pub fn send_text(&self, text: &str) -> usize {
        self.ws
            .lock()
            .unwrap()
            .clone()
            .map(|ws| ws.send_message_sync(OpCode::Text, text.as_bytes()))
            .unwrap_or(0)
    }

    /// Synchronous binary send; blocks until the frames drain. Illegal
    /// on worker threads (returns 0).
    pub fn send_binary(&self, payload: &[u8]) -> usize {
        self.ws
            .lock()
            .unwrap()
            .clone()
            .map(|ws| ws.send_message_sync(OpCode::Binary, payload))
            .unwrap_or(0)
    }

    /// Queues a ping (payload capped at 125 bytes).
    pub fn send_ping_async(&self, payload: &[u8]) -> bool {
        self.with_ws(|ws| ws.send_control(OpCode::Ping, payload))
    }

    /// Queues an unsolicited pong (payload capped at 125 bytes).
    pub fn send_pong_async(&self, payload: &[u8]) -> bool {
        self.with_ws(|ws| ws.send_control(OpCode::Pong, payload))
    }

    /// Initiates the close handshake with `code` and an optional
    /// reason.
    pub fn close_async(&self, code: u16, reason: &str) -> bool {
        let ws = self.ws.lock().unwrap().clone();
        match ws {
            Some(ws) => ws.close_async(code, reason),
            None => false,
        }
    }

    /// Total payload bytes received by the transport. Monotonic.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }

    /// Total payload bytes sent by the transport. Monotonic.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent()
    }

    /// The underlying TCP client.
    pub fn transport(&self) -> &TcpClient {
        &self.inner
    }

    fn with_ws(&self, f: impl FnOnce(&Arc<WsShared>) -> bool) -> bool {
        let ws = self.ws.lock().unwrap().clone();
        match ws {
            Some(ws) => f(&ws),
            None => false,
        }
    }
}
