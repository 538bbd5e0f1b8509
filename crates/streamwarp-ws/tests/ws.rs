//! Integration tests for WebSocket endpoints over loopback sockets:
//! echo, multicast, ping/pong, close handshake and protocol errors.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use streamwarp_core::{config::Config, error::Error};
use streamwarp_http::HttpRequest;
use streamwarp_service::Service;
use streamwarp_ws::{
    frame, WsClient, WsClientHandler, WsMessage, WsServer, WsServerHandler, WsSession,
    WsSessionHandler,
};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[derive(Default)]
struct SessionLog {
    connected: AtomicBool,
    ws_connected: AtomicBool,
    ws_disconnected: AtomicBool,
    received_bytes: AtomicUsize,
    pings: Mutex<Vec<Vec<u8>>>,
    closes: Mutex<Vec<(u16, String)>>,
    protocol_errors: AtomicUsize,
}

/// Echoes every message back on the session.
struct EchoWsSession {
    log: Arc<SessionLog>,
}

impl WsSessionHandler for EchoWsSession {
    fn on_connected(&mut self, _session: &WsSession) {
        self.log.connected.store(true, Ordering::Relaxed);
    }

    fn on_ws_connected(&mut self, _session: &WsSession, _request: &HttpRequest) {
        self.log.ws_connected.store(true, Ordering::Relaxed);
    }

    fn on_ws_received(&mut self, session: &WsSession, message: &WsMessage<'_>) {
        self.log.received_bytes.fetch_add(message.len(), Ordering::Relaxed);
        match message {
            WsMessage::Text(text) => session.send_text_async(text),
            WsMessage::Binary(bytes) => session.send_binary_async(bytes),
        };
    }

    fn on_ws_ping(&mut self, _session: &WsSession, payload: &[u8]) {
        self.log.pings.lock().unwrap().push(payload.to_vec());
    }

    fn on_ws_close(&mut self, _session: &WsSession, code: u16, reason: &str) {
        self.log.closes.lock().unwrap().push((code, reason.to_owned()));
    }

    fn on_ws_disconnected(&mut self, _session: &WsSession) {
        self.log.ws_disconnected.store(true, Ordering::Relaxed);
    }

    fn on_error(&mut self, _session: &WsSession, error: &Error) {
        if matches!(error, Error::WsProtocol(_)) {
            self.log.protocol_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct ServerLog {
    started: AtomicBool,
    stopped: AtomicBool,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    session: Mutex<Option<Arc<SessionLog>>>,
}

struct EchoWsServer {
    log: Arc<ServerLog>,
}

impl WsServerHandler for EchoWsServer {
    fn create_session(&mut self, _server: &WsServer) -> Box<dyn WsSessionHandler> {
        let session_log = Arc::new(SessionLog::default());
        *self.log.session.lock().unwrap() = Some(session_log.clone());
        Box::new(EchoWsSession { log: session_log })
    }

    fn on_started(&mut self, _server: &WsServer) {
        self.log.started.store(true, Ordering::Relaxed);
    }

    fn on_stopped(&mut self, _server: &WsServer) {
        self.log.stopped.store(true, Ordering::Relaxed);
    }

    fn on_connected(&mut self, _server: &WsServer, _session: &WsSession) {
        self.log.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _server: &WsServer, _session: &WsSession) {
        self.log.disconnected.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ClientLog {
    ws_connected: AtomicBool,
    ws_disconnected: AtomicBool,
    received_bytes: AtomicUsize,
    last_message: Mutex<Vec<u8>>,
    pongs: Mutex<Vec<Vec<u8>>>,
    closes: Mutex<Vec<(u16, String)>>,
    handshake_errors: AtomicUsize,
}

struct LoggingWsClient {
    log: Arc<ClientLog>,
}

impl WsClientHandler for LoggingWsClient {
    fn on_ws_connecting(&mut self, _client: &WsClient, request: &mut HttpRequest) {
        request.set_header("Origin", "http://localhost");
        request.set_header("Sec-WebSocket-Protocol", "chat, superchat");
    }

    fn on_ws_connected(&mut self, _client: &WsClient, _response: &streamwarp_http::HttpResponse) {
        self.log.ws_connected.store(true, Ordering::Relaxed);
    }

    fn on_ws_received(&mut self, _client: &WsClient, message: &WsMessage<'_>) {
        self.log.received_bytes.fetch_add(message.len(), Ordering::Relaxed);
        *self.log.last_message.lock().unwrap() = message.as_bytes().to_vec();
    }

    fn on_ws_pong(&mut self, _client: &WsClient, payload: &[u8]) {
        self.log.pongs.lock().unwrap().push(payload.to_vec());
    }

    fn on_ws_close(&mut self, _client: &WsClient, code: u16, reason: &str) {
        self.log.closes.lock().unwrap().push((code, reason.to_owned()));
    }

    fn on_ws_disconnected(&mut self, _client: &WsClient) {
        self.log.ws_disconnected.store(true, Ordering::Relaxed);
    }

    fn on_error(&mut self, _client: &WsClient, error: &Error) {
        if matches!(error, Error::WsHandshake(_)) {
            self.log.handshake_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn start_stack() -> (Service, WsServer, Arc<ServerLog>, u16) {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    let log = Arc::new(ServerLog::default());
    let server = WsServer::new(&service, "127.0.0.1", 0, Box::new(EchoWsServer { log: log.clone() }));
    assert!(server.start());
    let port = server.transport().local_address().unwrap().port();
    (service, server, log, port)
}

fn open_client(service: &Service, port: u16) -> (WsClient, Arc<ClientLog>) {
    let log = Arc::new(ClientLog::default());
    let client = WsClient::new(
        service,
        "127.0.0.1",
        port,
        Box::new(LoggingWsClient { log: log.clone() }),
    );
    assert!(client.connect());
    assert!(wait_until(Duration::from_secs(2), || log.ws_connected.load(Ordering::Relaxed)));
    (client, log)
}

#[test]
fn text_echo_round_trips_through_the_upgrade() {
    let (service, server, server_log, port) = start_stack();
    let (client, client_log) = open_client(&service, port);

    assert!(server_log.started.load(Ordering::Relaxed));
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 1));
    assert!(client.is_open());

    assert!(client.send_text_async("test"));
    assert!(wait_until(Duration::from_secs(2), || {
        client_log.received_bytes.load(Ordering::Relaxed) == 4
    }));
    assert_eq!(client_log.last_message.lock().unwrap().as_slice(), b"test");

    let session_log = server_log.session.lock().unwrap().clone().unwrap();
    assert!(session_log.ws_connected.load(Ordering::Relaxed));
    assert_eq!(session_log.received_bytes.load(Ordering::Relaxed), 4);

    client.disconnect();
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));
    assert_eq!(server_log.connected.load(Ordering::Relaxed), 1);
    assert_eq!(server_log.disconnected.load(Ordering::Relaxed), 1);

    server.stop();
    assert!(server_log.stopped.load(Ordering::Relaxed));
    service.stop();
}

#[test]
fn binary_echo_handles_fragmented_messages() {
    let service = Service::new(
        Config { worker_count: 2, ws_fragment_threshold: 1024, ..Config::default() },
        Arc::new(()),
    );
    assert!(service.start());
    let log = Arc::new(ServerLog::default());
    let server = WsServer::new(&service, "127.0.0.1", 0, Box::new(EchoWsServer { log: log.clone() }));
    assert!(server.start());
    let port = server.transport().local_address().unwrap().port();

    let (client, client_log) = open_client(&service, port);

    // Well above the fragment threshold: goes out as several frames,
    // comes back reassembled into one message.
    let payload = vec![0xc3u8; 10 * 1024];
    assert!(client.send_binary_async(&payload));
    assert!(wait_until(Duration::from_secs(5), || {
        client_log.received_bytes.load(Ordering::Relaxed) == payload.len()
    }));
    assert_eq!(*client_log.last_message.lock().unwrap(), payload);

    client.disconnect();
    server.stop();
    service.stop();
}

#[test]
fn multicast_counts_follow_join_order() {
    let (service, server, _server_log, port) = start_stack();

    let mut clients = Vec::new();
    for expected in 1..=3 {
        let (client, log) = open_client(&service, port);
        assert!(wait_until(Duration::from_secs(2), || server.clients() == expected));
        clients.push((client, log));
        assert!(server.multicast_text("test"));
    }

    let expected = [12usize, 8, 4];
    for ((_, log), expected_bytes) in clients.iter().zip(expected) {
        assert!(
            wait_until(Duration::from_secs(2), || {
                log.received_bytes.load(Ordering::Relaxed) == expected_bytes
            }),
            "expected {} bytes, saw {}",
            expected_bytes,
            log.received_bytes.load(Ordering::Relaxed)
        );
    }

    for (client, _) in &clients {
        client.disconnect();
    }
    server.stop();
    service.stop();
}

#[test]
fn ping_answers_pong_with_identical_payload() {
    let (service, server, server_log, port) = start_stack();
    let (client, client_log) = open_client(&service, port);

    let payload = b"thirteen-byte";
    assert_eq!(payload.len(), 13);
    assert!(client.send_ping_async(payload));

    assert!(wait_until(Duration::from_secs(2), || {
        !client_log.pongs.lock().unwrap().is_empty()
    }));
    assert_eq!(client_log.pongs.lock().unwrap()[0].as_slice(), payload);

    let session_log = server_log.session.lock().unwrap().clone().unwrap();
    assert_eq!(session_log.pings.lock().unwrap()[0].as_slice(), payload);

    client.disconnect();
    server.stop();
    service.stop();
}

#[test]
fn close_handshake_echoes_the_code_exactly_once() {
    let (service, server, server_log, port) = start_stack();
    let (client, client_log) = open_client(&service, port);

    assert!(client.close_async(1000, "done"));
    // The server answers with close(1000) and the transports wind down.
    assert!(wait_until(Duration::from_secs(2), || {
        client_log.ws_disconnected.load(Ordering::Relaxed)
    }));
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));

    let session_log = server_log.session.lock().unwrap().clone().unwrap();
    assert_eq!(session_log.closes.lock().unwrap().as_slice(), &[(1000, "done".to_owned())]);
    assert_eq!(client_log.closes.lock().unwrap().as_slice(), &[(1000, "done".to_owned())]);
    assert!(session_log.ws_disconnected.load(Ordering::Relaxed));

    server.stop();
    service.stop();
}

#[test]
fn invalid_utf8_text_closes_with_1007() {
    let (service, server, server_log, port) = start_stack();
    let (client, client_log) = open_client(&service, port);

    // Bypass the typed API: a raw masked text frame with invalid UTF-8.
    let mut raw = Vec::new();
    frame::encode_frame(
        &mut raw,
        true,
        frame::OpCode::Text,
        Some(frame::new_mask_key()),
        &[0xff, 0xfe, 0xfd],
    );
    assert!(client.transport().send_async(&raw));

    assert!(wait_until(Duration::from_secs(2), || {
        !client_log.closes.lock().unwrap().is_empty()
    }));
    assert_eq!(client_log.closes.lock().unwrap()[0].0, frame::close_code::INVALID_PAYLOAD);

    let session_log = server_log.session.lock().unwrap().clone().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session_log.protocol_errors.load(Ordering::Relaxed) == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));

    server.stop();
    service.stop();
}

#[test]
fn unmasked_client_frame_closes_with_1002() {
    let (service, server, _server_log, port) = start_stack();
    let (client, client_log) = open_client(&service, port);

    let mut raw = Vec::new();
    frame::encode_frame(&mut raw, true, frame::OpCode::Text, None, b"bare");
    assert!(client.transport().send_async(&raw));

    assert!(wait_until(Duration::from_secs(2), || {
        !client_log.closes.lock().unwrap().is_empty()
    }));
    assert_eq!(client_log.closes.lock().unwrap()[0].0, frame::close_code::PROTOCOL_ERROR);
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));

    server.stop();
    service.stop();
}

#[test]
fn oversized_message_closes_with_1009() {
    let service = Service::new(
        Config { worker_count: 2, ws_max_message_size: 256, ..Config::default() },
        Arc::new(()),
    );
    assert!(service.start());
    let log = Arc::new(ServerLog::default());
    let server = WsServer::new(&service, "127.0.0.1", 0, Box::new(EchoWsServer { log }));
    assert!(server.start());
    let port = server.transport().local_address().unwrap().port();
    let (client, client_log) = open_client(&service, port);

    let mut raw = Vec::new();
    frame::encode_frame(
        &mut raw,
        true,
        frame::OpCode::Binary,
        Some(frame::new_mask_key()),
        &vec![0u8; 1024],
    );
    assert!(client.transport().send_async(&raw));

    assert!(wait_until(Duration::from_secs(2), || {
        !client_log.closes.lock().unwrap().is_empty()
    }));
    assert_eq!(client_log.closes.lock().unwrap()[0].0, frame::close_code::MESSAGE_TOO_BIG);

    server.stop();
    service.stop();
}
