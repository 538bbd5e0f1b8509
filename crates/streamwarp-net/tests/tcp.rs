//! Integration tests for the TCP session fabric over real loopback
//! sockets: echo, multicast fan-out, backpressure and churn.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use streamwarp_core::{config::Config, error::Error, error::ErrorCategory};
use streamwarp_net::{TcpClient, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};
use streamwarp_service::Service;

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

fn started_service(workers: usize) -> Service {
    let service = Service::new(Config { worker_count: workers, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    service
}

#[derive(Default)]
struct ServerFlags {
    started: AtomicBool,
    stopped: AtomicBool,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    errors: AtomicUsize,
}

struct EchoSession {
    flags: Arc<ServerFlags>,
}

impl TcpSessionHandler for EchoSession {
    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        session.send_async(buffer);
    }

    fn on_error(&mut self, _session: &TcpSession, error: &Error) {
        // Peer resets during churn are expected transport noise.
        if error.category() != ErrorCategory::Transport {
            self.flags.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct EchoServer {
    flags: Arc<ServerFlags>,
}

impl TcpServerHandler for EchoServer {
    fn create_session(&mut self, _server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        Box::new(EchoSession { flags: self.flags.clone() })
    }

    fn on_started(&mut self, _server: &TcpServer) {
        self.flags.started.store(true, Ordering::Relaxed);
    }

    fn on_stopped(&mut self, _server: &TcpServer) {
        self.flags.stopped.store(true, Ordering::Relaxed);
    }

    fn on_connected(&mut self, _server: &TcpServer, _session: &TcpSession) {
        self.flags.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _server: &TcpServer, _session: &TcpSession) {
        self.flags.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_error(&mut self, _server: &TcpServer, _error: &Error) {
        self.flags.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ClientFlags {
    connected: AtomicBool,
    disconnected: AtomicBool,
    received: AtomicUsize,
    overflow_errors: AtomicUsize,
    other_errors: AtomicUsize,
}

struct CountingClient {
    flags: Arc<ClientFlags>,
}

impl TcpSessionHandler for CountingClient {
    fn on_connected(&mut self, _session: &TcpSession) {
        self.flags.connected.store(true, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _session: &TcpSession) {
        self.flags.disconnected.store(true, Ordering::Relaxed);
    }

    fn on_received(&mut self, _session: &TcpSession, buffer: &[u8]) {
        self.flags.received.fetch_add(buffer.len(), Ordering::Relaxed);
    }

    fn on_error(&mut self, _session: &TcpSession, error: &Error) {
        match error {
            Error::BufferOverflow { .. } => {
                self.flags.overflow_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.flags.other_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn start_echo_server(service: &Service) -> (TcpServer, Arc<ServerFlags>, u16) {
    let flags = Arc::new(ServerFlags::default());
    let server = TcpServer::new(
        service,
        "127.0.0.1",
        0,
        Box::new(EchoServer { flags: flags.clone() }),
    );
    assert!(server.start());
    let port = server.local_address().expect("server must be bound").port();
    (server, flags, port)
}

fn connect_client(service: &Service, port: u16) -> (TcpClient, Arc<ClientFlags>) {
    let flags = Arc::new(ClientFlags::default());
    let client = TcpClient::new(
        service,
        "127.0.0.1",
        port,
        Box::new(CountingClient { flags: flags.clone() }),
    );
    assert!(client.connect());
    (client, flags)
}

#[test]
fn echo_conserves_bytes() {
    let service = started_service(2);
    let (server, server_flags, port) = start_echo_server(&service);
    assert!(server_flags.started.load(Ordering::Relaxed));

    let (client, client_flags) = connect_client(&service, port);
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 1));

    assert!(client.send_async(b"test"));
    assert!(wait_until(Duration::from_secs(2), || {
        client_flags.received.load(Ordering::Relaxed) == 4
    }));

    assert_eq!(client.bytes_sent(), 4);
    assert_eq!(client.bytes_received(), 4);
    assert_eq!(server.bytes_received(), 4);
    assert_eq!(server.bytes_sent(), 4);

    assert!(client.disconnect());
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));
    assert!(client_flags.disconnected.load(Ordering::Relaxed));
    assert_eq!(server_flags.connected.load(Ordering::Relaxed), 1);
    assert_eq!(server_flags.disconnected.load(Ordering::Relaxed), 1);
    assert_eq!(server_flags.errors.load(Ordering::Relaxed), 0);
    assert_eq!(client_flags.other_errors.load(Ordering::Relaxed), 0);

    assert!(server.stop());
    assert!(server_flags.stopped.load(Ordering::Relaxed));
    assert!(service.stop());
}

#[test]
fn synchronous_send_drains_before_returning() {
    let service = started_service(2);
    let (_server, _flags, port) = start_echo_server(&service);
    let (client, client_flags) = connect_client(&service, port);

    let payload = vec![0x5a; 64 * 1024];
    assert_eq!(client.send(&payload), payload.len());
    assert!(wait_until(Duration::from_secs(5), || {
        client_flags.received.load(Ordering::Relaxed) == payload.len()
    }));

    client.disconnect();
    service.stop();
}

#[test]
fn multicast_reaches_each_connected_session() {
    let service = started_service(2);
    let (server, _flags, port) = start_echo_server(&service);

    // Three clients join one by one; a multicast follows each join,
    // so the first client sees three, the second two, the third one.
    let mut clients = Vec::new();
    for expected_clients in 1..=3 {
        let (client, flags) = connect_client(&service, port);
        assert!(wait_until(Duration::from_secs(2), || {
            server.clients() == expected_clients
        }));
        clients.push((client, flags));
        assert!(server.multicast(b"test"));
    }

    let expected = [12usize, 8, 4];
    for ((_, flags), expected_bytes) in clients.iter().zip(expected) {
        assert!(
            wait_until(Duration::from_secs(2), || {
                flags.received.load(Ordering::Relaxed) == expected_bytes
            }),
            "expected {} bytes, saw {}",
            expected_bytes,
            flags.received.load(Ordering::Relaxed)
        );
    }

    assert!(server.disconnect_all());
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));
    for (_, flags) in &clients {
        assert!(flags.disconnected.load(Ordering::Relaxed));
    }
    service.stop();
}

#[test]
fn find_session_resolves_live_ids() {
    let service = started_service(1);
    let (server, _flags, port) = start_echo_server(&service);
    let (client, _cflags) = connect_client(&service, port);
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 1));

    // The server-side session has its own id; probe via multicast of
    // nothing and table inspection instead.
    let bogus = streamwarp_core::id::SessionId::generate();
    assert!(server.find_session(bogus).is_none());

    client.disconnect();
    service.stop();
}

#[test]
fn send_buffer_overflow_reports_once_per_crossing() {
    // Tiny kernel buffers so the region limit is what trips, not the
    // kernel's own buffering.
    let config = Config {
        worker_count: 1,
        send_buffer_limit: 1024,
        socket_send_buffer_size: Some(4096),
        socket_recv_buffer_size: Some(4096),
        ..Config::default()
    };
    let service = Service::new(config, Arc::new(()));
    assert!(service.start());

    // A server that never reads back, so client sends pile up.
    struct SilentSession;
    impl TcpSessionHandler for SilentSession {}
    struct SilentServer;
    impl TcpServerHandler for SilentServer {
        fn create_session(&mut self, _server: &TcpServer) -> Box<dyn TcpSessionHandler> {
            Box::new(SilentSession)
        }
    }
    let server = TcpServer::new(&service, "127.0.0.1", 0, Box::new(SilentServer));
    assert!(server.start());
    let port = server.local_address().unwrap().port();

    let (client, client_flags) = connect_client(&service, port);

    // Flood until the region rejects. The kernel buffers some of it,
    // so keep pushing well past the limit.
    let chunk = vec![0u8; 512];
    let mut rejected = false;
    for _ in 0..4096 {
        if !client.send_async(&chunk) {
            rejected = true;
            break;
        }
    }
    assert!(rejected, "the send region limit must eventually reject");
    assert!(wait_until(Duration::from_secs(2), || {
        client_flags.overflow_errors.load(Ordering::Relaxed) >= 1
    }));
    // Once-per-crossing reporting itself is covered by the buffer
    // unit tests; here it must at least not flood one report per
    // rejected send.
    let reports = client_flags.overflow_errors.load(Ordering::Relaxed);
    assert!(reports < 8, "{} overflow reports for one flood", reports);

    client.disconnect();
    service.stop();
}

#[test]
fn wrong_state_operations_fail_cleanly() {
    let service = started_service(1);
    let flags = Arc::new(ClientFlags::default());
    let client = TcpClient::new(
        &service,
        "127.0.0.1",
        1,
        Box::new(CountingClient { flags: flags.clone() }),
    );

    // Not connected: sends are rejected without events.
    assert!(!client.send_async(b"nope"));
    assert!(!client.disconnect_async());

    // Connecting to a dead port reports a transport error and returns
    // to disconnected.
    assert!(!client.connect());
    assert!(wait_until(Duration::from_secs(2), || {
        flags.other_errors.load(Ordering::Relaxed) >= 1
    }));
    assert!(!client.is_connected());

    service.stop();
}

/// Bounded random churn: connects, disconnects, reconnects, multicasts
/// and sends against one echo server, then checks the fabric closed
/// every session it opened.
#[test]
fn random_churn_keeps_the_fabric_consistent() {
    let service = started_service(4);
    let (server, server_flags, port) = start_echo_server(&service);

    // Small deterministic LCG so failures reproduce.
    let mut seed: u64 = 0x5eed_cafe;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };

    let mut clients: Vec<(TcpClient, Arc<ClientFlags>)> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match next() % 10 {
            0 => {
                if clients.len() < 16 {
                    let (client, flags) = connect_client(&service, port);
                    clients.push((client, flags));
                }
            }
            1 => {
                if !clients.is_empty() {
                    let index = next() % clients.len();
                    let (client, _) = clients.remove(index);
                    client.disconnect_async();
                }
            }
            2 => {
                server.multicast(b"test");
            }
            3 => {
                server.disconnect_all();
            }
            _ => {
                // Default branch sends from a random client.
                if !clients.is_empty() {
                    let index = next() % clients.len();
                    clients[index].0.send_async(b"test");
                }
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    for (client, _) in &clients {
        client.disconnect_async();
    }
    assert!(wait_until(Duration::from_secs(5), || server.clients() == 0));
    assert!(server.stop());
    assert!(service.stop());

    assert!(server_flags.started.load(Ordering::Relaxed));
    assert!(server_flags.stopped.load(Ordering::Relaxed));
    assert!(server_flags.connected.load(Ordering::Relaxed) > 0);
    assert_eq!(
        server_flags.connected.load(Ordering::Relaxed),
        server_flags.disconnected.load(Ordering::Relaxed),
        "every connected session must disconnect exactly once"
    );
    assert!(server.bytes_received() > 0);
    assert!(server.bytes_sent() > 0);
    assert_eq!(server_flags.errors.load(Ordering::Relaxed), 0);
}
