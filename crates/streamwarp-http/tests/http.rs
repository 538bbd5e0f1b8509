//! Integration tests for HTTP endpoints over loopback sockets.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use streamwarp_core::config::Config;
use streamwarp_http::{
    HttpClient, HttpClientHandler, HttpRequest, HttpResponse, HttpServer, HttpServerHandler,
    HttpSession, HttpSessionHandler,
};
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

struct GreetingSession;

impl HttpSessionHandler for GreetingSession {
    fn on_received_request(&mut self, session: &HttpSession, request: &HttpRequest) {
        let mut response = match request.target() {
            "/hello" => {
                let mut response = HttpResponse::make_ok_response();
                response.set_header("Content-Type", "text/plain; charset=UTF-8");
                response.set_body(format!("hello, {}", request.method()));
                response
            }
            _ => HttpResponse::make_error_response(404, "no such resource"),
        };
        response.set_header("Server", "streamwarp-test");
        session.send_response_async(&response);
    }
}

struct GreetingServer;

impl HttpServerHandler for GreetingServer {
    fn create_session(&mut self, _server: &HttpServer) -> Box<dyn HttpSessionHandler> {
        Box::new(GreetingSession)
    }
}

#[derive(Default)]
struct ClientLog {
    responses: Mutex<Vec<HttpResponse>>,
    parse_errors: AtomicUsize,
    disconnects: AtomicUsize,
}

struct LoggingClient {
    log: Arc<ClientLog>,
}

impl HttpClientHandler for LoggingClient {
    fn on_received_response(&mut self, _client: &HttpClient, response: &HttpResponse) {
        self.log.responses.lock().unwrap().push(response.clone());
    }

    fn on_received_response_error(
        &mut self,
        _client: &HttpClient,
        _error: &streamwarp_core::error::Error,
    ) {
        self.log.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&mut self, _client: &HttpClient) {
        self.log.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

fn start_stack() -> (Service, HttpServer, u16) {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    let server = HttpServer::new(&service, "127.0.0.1", 0, Box::new(GreetingServer));
    assert!(server.start());
    let port = server.transport().local_address().unwrap().port();
    (service, server, port)
}

#[test]
fn request_response_round_trip() {
    let (service, server, port) = start_stack();

    let log = Arc::new(ClientLog::default());
    let client =
        HttpClient::new(&service, "127.0.0.1", port, Box::new(LoggingClient { log: log.clone() }));
    assert!(client.connect());

    let mut request = HttpRequest::make_get_request("/hello");
    request.set_header("Host", "localhost");
    assert!(client.send_request_async(&request));

    assert!(wait_until(Duration::from_secs(2), || !log.responses.lock().unwrap().is_empty()));
    {
        let responses = log.responses.lock().unwrap();
        assert_eq!(responses[0].status(), 200);
        assert_eq!(responses[0].body(), b"hello, GET");
        assert_eq!(responses[0].header("server"), Some("streamwarp-test"));
    }

    // Keep-alive: a second request on the same connection.
    assert!(client.send_request_async(&HttpRequest::make_get_request("/missing")));
    assert!(wait_until(Duration::from_secs(2), || log.responses.lock().unwrap().len() == 2));
    assert_eq!(log.responses.lock().unwrap()[1].status(), 404);
    assert_eq!(log.parse_errors.load(Ordering::Relaxed), 0);

    client.disconnect();
    server.stop();
    service.stop();
}

#[test]
fn connection_close_ends_the_session_after_the_response() {
    let (service, server, port) = start_stack();

    let log = Arc::new(ClientLog::default());
    let client =
        HttpClient::new(&service, "127.0.0.1", port, Box::new(LoggingClient { log: log.clone() }));
    assert!(client.connect());

    let mut request = HttpRequest::make_get_request("/hello");
    request.set_header("Host", "localhost");
    request.set_header("Connection", "close");
    assert!(client.send_request_async(&request));

    assert!(wait_until(Duration::from_secs(2), || !log.responses.lock().unwrap().is_empty()));
    assert!(wait_until(Duration::from_secs(2), || server.clients() == 0));
    assert!(wait_until(Duration::from_secs(2), || {
        log.disconnects.load(Ordering::Relaxed) == 1
    }));

    server.stop();
    service.stop();
}

#[test]
fn post_body_reaches_the_handler() {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    struct EchoBodySession;
    impl HttpSessionHandler for EchoBodySession {
        fn on_received_request(&mut self, session: &HttpSession, request: &HttpRequest) {
            let mut response = HttpResponse::make_ok_response();
            response.set_body(request.body().to_vec());
            session.send_response_async(&response);
        }
    }
    struct EchoBodyServer;
    impl HttpServerHandler for EchoBodyServer {
        fn create_session(&mut self, _server: &HttpServer) -> Box<dyn HttpSessionHandler> {
            Box::new(EchoBodySession)
        }
    }

    let server = HttpServer::new(&service, "127.0.0.1", 0, Box::new(EchoBodyServer));
    assert!(server.start());
    let port = server.transport().local_address().unwrap().port();

    let log = Arc::new(ClientLog::default());
    let client =
        HttpClient::new(&service, "127.0.0.1", port, Box::new(LoggingClient { log: log.clone() }));
    assert!(client.connect());

    let body = vec![0xa5u8; 9000];
    let request = HttpRequest::make_post_request("/upload", body.clone());
    assert!(client.send_request_async(&request));

    assert!(wait_until(Duration::from_secs(2), || !log.responses.lock().unwrap().is_empty()));
    assert_eq!(log.responses.lock().unwrap()[0].body(), body.as_slice());

    client.disconnect();
    server.stop();
    service.stop();
}
