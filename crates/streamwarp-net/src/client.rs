//! Stream clients: connect path over the shared session core.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use rustls::{pki_types::ServerName, ClientConfig as TlsClientConfig, ClientConnection};
use tracing::debug;

use streamwarp_core::{error::Error, id::SessionId};
use streamwarp_service::Service;

use crate::{
    handler::{TcpSessionHandler, TlsSessionHandler},
    session::{HandlerSlot, SessionCore, SessionState, TcpSession, TlsSession},
};

pub(crate) struct ClientCore {
    session: Arc<SessionCore>,
    address: String,
    port: u16,
    tls: Option<Arc<TlsClientConfig>>,
}

impl ClientCore {
    /// Posts the connect sequence onto the session strand: resolve,
    /// initiate the non-blocking connect, and (for TLS) prepare the
    /// engine whose first flight goes out on writability.
    fn connect_async(self: &Arc<Self>) -> bool {
        if self.session.state() != SessionState::Disconnected {
            return false;
        }
        self.session.set_state(SessionState::Pending);
        let core = self.clone();
        let posted = self.session.strand().post(move || core.start_connect());
        if !posted {
            self.session.set_state(SessionState::Disconnected);
        }
        posted
    }

    fn start_connect(self: &Arc<Self>) {
        let address = match crate::resolve::resolve_endpoint(&self.address, self.port) {
            Ok(address) => address,
            Err(e) => {
                debug!(host = %self.address, "resolve failed: {}", e);
                self.session.emit_error(&Error::Transport(e));
                self.session.set_state(SessionState::Disconnected);
                return;
            }
        };
        let tls = match self.make_tls_engine() {
            Ok(tls) => tls,
            Err(error) => {
                self.session.emit_error(&error);
                self.session.set_state(SessionState::Disconnected);
                return;
            }
        };
        self.session.start_connect(address, tls);
    }

    fn make_tls_engine(&self) -> Result<Option<Box<rustls::Connection>>, Error> {
        let Some(tls_config) = &self.tls else {
            return Ok(None);
        };
        let name = ServerName::try_from(self.address.as_str())
            .map_err(|_| Error::InvalidArgument("address is not a valid TLS server name"))?
            .to_owned();
        let conn = ClientConnection::new(tls_config.clone(), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Some(Box::new(rustls::Connection::Client(conn))))
    }

    /// Blocks the caller until the pending connect resolves either way.
    fn connect(self: &Arc<Self>) -> bool {
        if !self.connect_async() {
            return false;
        }
        if Service::is_worker_thread() {
            return false;
        }
        self.session.wait_lifecycle(SessionState::Pending);
        self.session.is_connected()
    }
}

macro_rules! client_handle_impl {
    ($name:ident, $session:ident) => {
        impl $name {
            /// Stable identifier of the underlying session.
            pub fn id(&self) -> SessionId {
                self.core.session.id()
            }

            /// Configured remote host.
            pub fn address(&self) -> &str {
                &self.core.address
            }

            /// Configured remote port.
            pub fn port(&self) -> u16 {
                self.core.port
            }

            /// Resolved peer address once connected.
            pub fn peer_address(&self) -> Option<SocketAddr> {
                self.core.session.peer_address()
            }

            /// Whether the session is fully established.
            pub fn is_connected(&self) -> bool {
                self.core.session.is_connected()
            }

            /// Total payload bytes sent. Monotonic.
            pub fn bytes_sent(&self) -> u64 {
                self.core.session.bytes_sent()
            }

            /// Total payload bytes received. Monotonic.
            pub fn bytes_received(&self) -> u64 {
                self.core.session.bytes_received()
            }

            /// Initiates the connection; `on_connecting` then either
            /// `on_connected` or `on_error` follow on the strand.
            /// Reconnecting a disconnected client is the same call.
            pub fn connect_async(&self) -> bool {
                self.core.connect_async()
            }

            /// Synchronous connect: blocks until established or
            /// failed. Illegal on worker threads (initiates and
            /// returns `false`).
            pub fn connect(&self) -> bool {
                self.core.connect()
            }

            /// Initiates a graceful close.
            pub fn disconnect_async(&self) -> bool {
                self.core.session.disconnect_async()
            }

            /// Synchronous close: blocks until torn down. Illegal on
            /// worker threads, where it only initiates.
            pub fn disconnect(&self) -> bool {
                self.core.session.disconnect()
            }

            /// Appends bytes to the send region and schedules a flush.
            pub fn send_async(&self, data: &[u8]) -> bool {
                self.core.session.send_async(data)
            }

            /// Synchronous send: blocks until the region drains.
            /// Illegal on worker threads (returns 0).
            pub fn send(&self, data: &[u8]) -> usize {
                self.core.session.send(data)
            }

            /// Handle to the underlying session.
            pub fn session(&self) -> $session {
                $session { core: self.core.session.clone() }
            }
        }
    };
}

/// A TCP client endpoint.
///
/// The handler receives the same session events an accepted server
/// session would, plus `on_connecting` before each connect attempt.
#[derive(Clone)]
pub struct TcpClient {
    core: Arc<ClientCore>,
}

impl TcpClient {
    /// Creates a disconnected client for `address:port`.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn TcpSessionHandler>,
    ) -> Self {
        let session = SessionCore::new(
            service.clone(),
            service.config().clone(),
            Weak::new(),
            HandlerSlot::Tcp(handler),
        );
        Self {
            core: Arc::new(ClientCore {
                session,
                address: address.to_owned(),
                port,
                tls: None,
            }),
        }
    }
}

/// A TLS client endpoint; `on_connected` fires only after the
/// handshake with the configured server name succeeds.
#[derive(Clone)]
pub struct TlsClient {
    core: Arc<ClientCore>,
}

impl TlsClient {
    /// Creates a disconnected TLS client for `address:port`. The
    /// address doubles as the TLS server name.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        tls_config: Arc<TlsClientConfig>,
        handler: Box<dyn TlsSessionHandler>,
    ) -> Self {
        let session = SessionCore::new(
            service.clone(),
            service.config().clone(),
            Weak::new(),
            HandlerSlot::Tls(handler),
        );
        Self {
            core: Arc::new(ClientCore {
                session,
                address: address.to_owned(),
                port,
                tls: Some(tls_config),
            }),
        }
    }
}

client_handle_impl!(TcpClient, TcpSession);
client_handle_impl!(TlsClient, TlsSession);
