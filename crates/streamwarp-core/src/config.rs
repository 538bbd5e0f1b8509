use std::{default::Default, time::Duration};

#[derive(Clone, Debug)]
/// Configuration options to tune endpoint and runtime behavior.
pub struct Config {
    /// Number of worker threads servicing the reactor (0 = number of CPUs).
    pub worker_count: usize,
    /// Spin workers with idle callbacks instead of parking them between jobs.
    pub polling: bool,
    /// Initial size of a session's receive region in bytes.
    pub receive_buffer_initial: usize,
    /// Max size the receive region may grow to in bytes (0 = unbounded).
    pub receive_buffer_limit: usize,
    /// Max pending bytes in a session's send region before sends are rejected (0 = unbounded).
    pub send_buffer_limit: usize,
    /// Disable Nagle's algorithm on stream sockets.
    /// Corresponds to the TCP_NODELAY socket option.
    pub no_delay: bool,
    /// Enable periodic keep-alive probing on stream sockets.
    /// Corresponds to the SO_KEEPALIVE socket option.
    pub keep_alive: bool,
    /// Allow rebinding a listening address in TIME_WAIT.
    /// Corresponds to the SO_REUSEADDR socket option.
    pub reuse_address: bool,
    /// Allow multiple listeners on the same address/port pair.
    /// Corresponds to the SO_REUSEPORT socket option (no-op where unsupported).
    pub reuse_port: bool,
    /// Kernel receive buffer size in bytes (None = use system default).
    /// Corresponds to the SO_RCVBUF socket option.
    pub socket_recv_buffer_size: Option<usize>,
    /// Kernel send buffer size in bytes (None = use system default).
    /// Corresponds to the SO_SNDBUF socket option.
    pub socket_send_buffer_size: Option<usize>,
    /// Max accumulated size of an HTTP header block in bytes.
    pub http_max_header_size: usize,
    /// Max size of an HTTP message body in bytes (0 = unbounded).
    pub http_max_body_size: usize,
    /// Max size of a reassembled WebSocket message in bytes.
    pub ws_max_message_size: usize,
    /// Payloads above this size are fragmented into multiple frames.
    pub ws_fragment_threshold: usize,
    /// How long to wait for the peer's close frame before forcing the
    /// transport closed.
    pub ws_close_timeout: Duration,
}

impl Config {
    /// Effective worker count, resolving 0 to the number of CPUs.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism().map(usize::from).unwrap_or(1)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            polling: false,
            receive_buffer_initial: 8192,
            receive_buffer_limit: 0,
            send_buffer_limit: 0,
            no_delay: false,
            keep_alive: false,
            reuse_address: true,
            reuse_port: false,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            http_max_header_size: 8192,
            http_max_body_size: 0,
            ws_max_message_size: 16 * 1024 * 1024,
            ws_fragment_threshold: 65536,
            ws_close_timeout: Duration::from_secs(5),
        }
    }
}
