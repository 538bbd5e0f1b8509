//! Whole-stack tests through the facade: silence after stop and
//! lifecycle symmetry under service-level shutdown.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use streamwarp::prelude::*;

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
struct Counters {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    received: AtomicUsize,
}

struct CountingSession {
    counters: Arc<Counters>,
}

impl TcpSessionHandler for CountingSession {
    fn on_connected(&mut self, _session: &TcpSession) {
        self.counters.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _session: &TcpSession) {
        self.counters.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        self.counters.received.fetch_add(buffer.len(), Ordering::Relaxed);
        session.send_async(buffer);
    }
}

struct CountingServer {
    counters: Arc<Counters>,
}

impl TcpServerHandler for CountingServer {
    fn create_session(&mut self, _server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        Box::new(CountingSession { counters: self.counters.clone() })
    }
}

#[test]
fn service_stop_closes_every_session_exactly_once() {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let counters = Arc::new(Counters::default());
    let server = TcpServer::new(
        &service,
        "127.0.0.1",
        0,
        Box::new(CountingServer { counters: counters.clone() }),
    );
    assert!(server.start());
    let port = server.local_address().unwrap().port();

    let clients: Vec<TcpClient> = (0..5)
        .map(|_| {
            let client = TcpClient::new(&service, "127.0.0.1", port, Box::new(()));
            assert!(client.connect());
            client
        })
        .collect();
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 5));

    // Service-level shutdown without stopping the server first: every
    // registered endpoint aborts into its terminal transition.
    assert!(service.stop());
    assert_eq!(counters.connected.load(Ordering::Relaxed), 5);
    assert_eq!(counters.disconnected.load(Ordering::Relaxed), 5);
    for client in &clients {
        assert!(!client.is_connected());
    }
}

#[test]
fn no_events_are_delivered_after_stop_returns() {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let counters = Arc::new(Counters::default());
    let server = TcpServer::new(
        &service,
        "127.0.0.1",
        0,
        Box::new(CountingServer { counters: counters.clone() }),
    );
    assert!(server.start());
    let port = server.local_address().unwrap().port();

    let client = TcpClient::new(&service, "127.0.0.1", port, Box::new(()));
    assert!(client.connect());
    for _ in 0..16 {
        client.send_async(&[0x42; 256]);
    }

    assert!(service.stop());
    let received = counters.received.load(Ordering::Relaxed);
    let disconnected = counters.disconnected.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(counters.received.load(Ordering::Relaxed), received);
    assert_eq!(counters.disconnected.load(Ordering::Relaxed), disconnected);
    assert_eq!(disconnected, counters.connected.load(Ordering::Relaxed));
}
