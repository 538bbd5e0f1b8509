//! HTTP client endpoint composed over the TCP layer.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use streamwarp_core::error::Error;
use streamwarp_net::{TcpClient, TcpSession, TcpSessionHandler};
use streamwarp_service::Service;

use crate::{message::HttpRequest, parser::ResponseParser, HttpResponse};

/// Event sink for an HTTP client.
pub trait HttpClientHandler: Send {
    /// The underlying transport connected.
    fn on_connected(&mut self, client: &HttpClient) {
        let _ = client;
    }
    /// The underlying transport closed.
    fn on_disconnected(&mut self, client: &HttpClient) {
        let _ = client;
    }
    /// A complete response arrived.
    fn on_received_response(&mut self, client: &HttpClient, response: &HttpResponse) {
        let _ = (client, response);
    }
    /// The inbound byte stream failed to parse as a response; the
    /// connection closes after this call.
    fn on_received_response_error(&mut self, client: &HttpClient, error: &Error) {
        let _ = (client, error);
    }
    /// An error was attributed to this client.
    fn on_error(&mut self, client: &HttpClient, error: &Error) {
        let _ = (client, error);
    }
}

impl HttpClientHandler for () {}

struct HttpClientAdapter {
    handler: Box<dyn HttpClientHandler>,
    parser: ResponseParser,
    client: Arc<OnceLock<TcpClient>>,
}

impl HttpClientAdapter {
    fn client(&self) -> Option<HttpClient> {
        self.client.get().map(|inner| HttpClient {
            inner: inner.clone(),
            slot: self.client.clone(),
        })
    }
}

impl TcpSessionHandler for HttpClientAdapter {
    fn on_connected(&mut self, session: &TcpSession) {
        // Fresh parse state for each (re)connect.
        let config = session.service().config();
        self.parser = ResponseParser::new(config.http_max_header_size, config.http_max_body_size);
        if let Some(client) = self.client() {
            self.handler.on_connected(&client);
        }
    }

    fn on_disconnected(&mut self, _session: &TcpSession) {
        if let Some(client) = self.client() {
            if let Some(response) = self.parser.finish_eof() {
                self.handler.on_received_response(&client, &response);
            }
            self.handler.on_disconnected(&client);
        }
    }

    fn on_received(&mut self, session: &TcpSession, buffer: &[u8]) {
        let Some(client) = self.client() else {
            return;
        };
        match self.parser.advance(buffer) {
            Ok(responses) => {
                for response in responses {
                    let close = !response.keep_alive();
                    self.handler.on_received_response(&client, &response);
                    if close {
                        session.disconnect_async();
                    }
                }
            }
            Err(error) => {
                debug!(session = %session.id(), "response parse failed: {}", error);
                self.handler.on_received_response_error(&client, &error);
                session.disconnect_async();
            }
        }
    }

    fn on_error(&mut self, _session: &TcpSession, error: &Error) {
        if let Some(client) = self.client() {
            self.handler.on_error(&client, error);
        }
    }
}

/// An HTTP/1.1 client over a TCP transport.
#[derive(Clone)]
pub struct HttpClient {
    inner: TcpClient,
    slot: Arc<OnceLock<TcpClient>>,
}

impl HttpClient {
    /// Creates a disconnected client for `address:port`.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn HttpClientHandler>,
    ) -> Self {
        let config = service.config();
        let slot = Arc::new(OnceLock::new());
        let adapter = HttpClientAdapter {
            handler,
            parser: ResponseParser::new(config.http_max_header_size, config.http_max_body_size),
            client: slot.clone(),
        };
        let inner = TcpClient::new(service, address, port, Box::new(adapter));
        let _ = slot.set(inner.clone());
        Self { inner, slot }
    }

    /// Initiates the connection.
    pub fn connect_async(&self) -> bool {
        self.inner.connect_async()
    }

    /// Synchronous connect; illegal on worker threads.
    pub fn connect(&self) -> bool {
        self.inner.connect()
    }

    /// Initiates a graceful close.
    pub fn disconnect_async(&self) -> bool {
        self.inner.disconnect_async()
    }

    /// Synchronous close; illegal on worker threads.
    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Serializes and queues a request.
    pub fn send_request_async(&self, request: &HttpRequest) -> bool {
        self.inner.send_async(&request.to_bytes())
    }

    /// Synchronous request send; blocks until the bytes drain.
    /// Illegal on worker threads (returns 0).
    pub fn send_request(&self, request: &HttpRequest) -> usize {
        self.inner.send(&request.to_bytes())
    }

    /// The underlying TCP client.
    pub fn transport(&self) -> &TcpClient {
        &self.inner
    }
}
