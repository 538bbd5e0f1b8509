//! Simple client that sends messages to an echo server and prints replies.
//!
//! Run the server first:
//! - cargo run -p streamwarp --example echo_server -- 127.0.0.1 7777
//!
//! Then run the client:
//! - cargo run -p streamwarp --example echo_client -- 127.0.0.1 7777
//! - cargo run -p streamwarp --example echo_client -- 127.0.0.1 7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{env, sync::Arc, thread, time::Duration};

use streamwarp::{Config, Service, TcpClient, TcpSession, TcpSessionHandler};

struct PrintingSession;

impl TcpSessionHandler for PrintingSession {
    fn on_connected(&mut self, session: &TcpSession) {
        println!("[connected] {}", session.peer_address().map(|a| a.to_string()).unwrap_or_default());
    }

    fn on_received(&mut self, _session: &TcpSession, buffer: &[u8]) {
        println!("[echo] {}", String::from_utf8_lossy(buffer));
    }

    fn on_disconnected(&mut self, _session: &TcpSession) {
        println!("[disconnected]");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Args: <address> <port> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(9000);
    let count: usize = args.next().and_then(|c| c.parse().ok()).unwrap_or(5);
    let interval_ms: u64 = args.next().and_then(|i| i.parse().ok()).unwrap_or(300);

    let service = Service::new(Config::default(), Arc::new(()));
    service.start();

    let client = TcpClient::new(&service, &address, port, Box::new(PrintingSession));
    if !client.connect() {
        eprintln!("failed to connect to {}:{}", address, port);
        service.stop();
        return;
    }

    for i in 0..count {
        let message = format!("hello {} from streamwarp", i);
        client.send_async(message.as_bytes());
        thread::sleep(Duration::from_millis(interval_ms));
    }

    client.disconnect();
    service.stop();
}
