//! WebSocket chat server: every text message fans out to all open
//! sessions.
//!
//! Run:
//! - cargo run -p streamwarp --example ws_chat_server -- 127.0.0.1 8081

use std::{env, sync::Arc, thread, time::Duration};

use streamwarp::{
    Config, Service, WsMessage, WsServer, WsServerHandler, WsSession, WsSessionHandler,
};

struct ChatSession {
    server: WsServer,
}

impl WsSessionHandler for ChatSession {
    fn on_ws_connected(&mut self, _session: &WsSession, request: &streamwarp::HttpRequest) {
        println!("[join] {}", request.target());
    }

    fn on_ws_received(&mut self, _session: &WsSession, message: &WsMessage<'_>) {
        if let WsMessage::Text(text) = message {
            self.server.multicast_text(text);
        }
    }

    fn on_ws_close(&mut self, _session: &WsSession, code: u16, reason: &str) {
        println!("[close] {} {:?}", code, reason);
    }
}

struct ChatServer;

impl WsServerHandler for ChatServer {
    fn create_session(&mut self, server: &WsServer) -> Box<dyn WsSessionHandler> {
        Box::new(ChatSession { server: server.clone() })
    }

    fn on_started(&mut self, _server: &WsServer) {
        println!("chat server started");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(8081);

    let service = Service::new(Config::default(), Arc::new(()));
    service.start();

    let server = WsServer::new(&service, &address, port, Box::new(ChatServer));
    if !server.start() {
        eprintln!("failed to start the chat server on {}:{}", address, port);
        return;
    }

    println!("WebSocket chat on ws://{}:{}/ — press Ctrl-C to stop.", address, port);
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
