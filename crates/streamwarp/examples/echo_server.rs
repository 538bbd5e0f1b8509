//! Simple TCP echo server using Streamwarp.
//!
//! Run:
//! - cargo run -p streamwarp --example echo_server
//! - cargo run -p streamwarp --example echo_server -- 127.0.0.1 7777

use std::{env, sync::Arc, thread, time::Duration};

use streamwarp::{Config, Service, TcpServer, TcpServerHandler, TcpSession, TcpSessionHandler};

struct EchoSession;

impl TcpSessionHandler for EchoSession {
    fn on_connected(&mut self, session: &TcpSession) {
        println!("[connect] {} ({})", session.peer_address().map(|a| a.to_string()).unwrap_or_default(), session.id());
    }

    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        session.send_async(buffer);
    }

    fn on_disconnected(&mut self, session: &TcpSession) {
        println!("[disconnect] {}", session.id());
    }
}

struct EchoServer;

impl TcpServerHandler for EchoServer {
    fn create_session(&mut self, _server: &TcpServer) -> Box<dyn TcpSessionHandler> {
        Box::new(EchoSession)
    }

    fn on_started(&mut self, server: &TcpServer) {
        println!(
            "Streamwarp echo server listening on {}",
            server.local_address().map(|a| a.to_string()).unwrap_or_default()
        );
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(9000);

    let service = Service::new(Config::default(), Arc::new(()));
    service.start();

    let server = TcpServer::new(&service, &address, port, Box::new(EchoServer));
    if !server.start() {
        eprintln!("failed to start the server on {}:{}", address, port);
        return;
    }

    println!("Press Ctrl-C to stop.");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
