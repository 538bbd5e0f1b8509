//! Stream servers: accept loop, session table and fan-out.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use mio::{net::TcpListener, Interest, Token};
use rustls::{ServerConfig as TlsServerConfig, ServerConnection};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use streamwarp_core::{config::Config, error::Error, id::SessionId};
use streamwarp_service::{ReadySource, Service, Strand};

use crate::{
    handler::{TcpServerHandler, TlsServerHandler},
    session::{HandlerSlot, SessionCore, TcpSession, TlsSession},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ServerState {
    Stopped = 0,
    Started = 1,
}

pub(crate) enum ServerHandlerSlot {
    Tcp(Box<dyn TcpServerHandler>),
    Tls(Box<dyn TlsServerHandler>),
}

pub(crate) struct ServerCore {
    service: Service,
    config: Config,
    strand: Strand,
    address: String,
    port: u16,
    local: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<TcpListener>>,
    token: Mutex<Option<Token>>,
    state: AtomicU8,
    handler: Mutex<ServerHandlerSlot>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionCore>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    tls: Option<Arc<TlsServerConfig>>,
    pending_accept: AtomicBool,
}

impl ServerCore {
    fn new(
        service: Service,
        address: &str,
        port: u16,
        tls: Option<Arc<TlsServerConfig>>,
        handler: ServerHandlerSlot,
    ) -> Arc<Self> {
        let strand = service.strand();
        let config = service.config().clone();
        Arc::new(Self {
            service,
            config,
            strand,
            address: address.to_owned(),
            port,
            local: Mutex::new(None),
            listener: Mutex::new(None),
            token: Mutex::new(None),
            state: AtomicU8::new(ServerState::Stopped as u8),
            handler: Mutex::new(handler),
            sessions: Mutex::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            tls,
            pending_accept: AtomicBool::new(false),
        })
    }

    fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == ServerState::Started as u8
    }

    /// Binds, configures and registers the listening socket, then
    /// reports `on_started` on the server strand.
    fn start(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        match self.bind_listener() {
            Ok(()) => {
                let core = self.clone();
                self.strand.post(move || core.emit_started());
                true
            }
            Err(e) => {
                error!(address = %self.address, port = self.port, "server start failed: {}", e);
                self.state.store(ServerState::Stopped as u8, Ordering::Release);
                let core = self.clone();
                let error = Error::Transport(e);
                self.strand.post(move || core.emit_server_error(&error));
                false
            }
        }
    }

    fn bind_listener(self: &Arc<Self>) -> std::io::Result<()> {
        let addr = crate::resolve::resolve_endpoint(&self.address, self.port)?;
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if self.config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        #[cfg(unix)]
        if self.config.reuse_port {
            socket.set_reuse_port(true)?;
        }
        if let Some(size) = self.config.socket_recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.config.socket_send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());
        *self.local.lock().unwrap() = Some(listener.local_addr()?);
        let ready: Arc<dyn ReadySource> = self.clone();
        let token = self.service.register_source(&mut listener, Interest::READABLE, ready)?;
        *self.token.lock().unwrap() = Some(token);
        *self.listener.lock().unwrap() = Some(listener);
        debug!(address = %self.address, port = self.port, "server listening");
        Ok(())
    }

    /// Closes the listener, disconnects every session and reports
    /// `on_stopped`.
    fn stop(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(
                ServerState::Started as u8,
                ServerState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.close_listener();
        self.disconnect_all();
        let core = self.clone();
        self.strand.post(move || core.emit_stopped());
        true
    }

    fn close_listener(&self) {
        let token = self.token.lock().unwrap().take();
        if let Some(mut listener) = self.listener.lock().unwrap().take() {
            if let Some(token) = token {
                self.service.deregister_source(&mut listener, token);
            }
        }
    }

    fn restart(self: &Arc<Self>) -> bool {
        self.stop() && self.start()
    }

    /// Sends the payload to every current session. Per-session
    /// ordering only; no cross-session atomicity.
    fn multicast(self: &Arc<Self>, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        let snapshot: Vec<Arc<SessionCore>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in snapshot {
            session.send_async(data);
        }
        true
    }

    fn disconnect_all(self: &Arc<Self>) -> bool {
        let snapshot: Vec<Arc<SessionCore>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in snapshot {
            session.disconnect_async();
        }
        true
    }

    fn find_session(&self, id: SessionId) -> Option<Arc<SessionCore>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    fn clients(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Accept loop: drains the listener, constructing one session per
    /// connection. Runs on the server strand.
    fn process_accept(self: &Arc<Self>) {
        self.pending_accept.store(false, Ordering::Release);
        loop {
            if !self.is_started() {
                return;
            }
            let accepted = {
                let listener = self.listener.lock().unwrap();
                let Some(listener) = listener.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => self.accept_session(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.emit_server_error(&Error::Transport(e));
                    return;
                }
            }
        }
    }

    /// Builds a session for an accepted stream and hands the socket to
    /// its strand. The session joins the table before any of its
    /// events fire.
    fn accept_session(self: &Arc<Self>, stream: mio::net::TcpStream, peer: SocketAddr) {
        let tls_conn = match &self.tls {
            Some(tls_config) => match ServerConnection::new(tls_config.clone()) {
                Ok(conn) => Some(Box::new(rustls::Connection::Server(conn))),
                Err(e) => {
                    self.emit_server_error(&Error::Tls(e.to_string()));
                    return;
                }
            },
            None => None,
        };
        let slot = {
            let mut handler = self.handler.lock().unwrap();
            match &mut *handler {
                ServerHandlerSlot::Tcp(h) => {
                    HandlerSlot::Tcp(h.create_session(&TcpServer { core: self.clone() }))
                }
                ServerHandlerSlot::Tls(h) => {
                    HandlerSlot::Tls(h.create_session(&TlsServer { core: self.clone() }))
                }
            }
        };
        let session = SessionCore::new(
            self.service.clone(),
            self.config.clone(),
            Arc::downgrade(self),
            slot,
        );
        self.sessions.lock().unwrap().insert(session.id(), session.clone());
        let core = session.clone();
        session.strand().post(move || core.adopt_accepted(stream, peer, tls_conn));
    }

    /// Called from a session strand when an accepted session finishes
    /// connecting (TLS: after the handshake).
    pub(crate) fn session_connected(self: &Arc<Self>, session: Arc<SessionCore>) {
        let server = self.clone();
        self.strand.post(move || server.emit_connected(&session));
    }

    /// Called from a session strand on the disconnected transition;
    /// removes the session from the table and reports it.
    pub(crate) fn session_disconnected(
        self: &Arc<Self>,
        session: Arc<SessionCore>,
        was_connected: bool,
    ) {
        let server = self.clone();
        self.strand.post(move || {
            server.sessions.lock().unwrap().remove(&session.id());
            if was_connected {
                server.emit_disconnected(&session);
            }
        });
    }

    pub(crate) fn account_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn account_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    // Event emission, always on the server strand.

    fn emit_started(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            ServerHandlerSlot::Tcp(h) => h.on_started(&TcpServer { core: self.clone() }),
            ServerHandlerSlot::Tls(h) => h.on_started(&TlsServer { core: self.clone() }),
        }
    }

    fn emit_stopped(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            ServerHandlerSlot::Tcp(h) => h.on_stopped(&TcpServer { core: self.clone() }),
            ServerHandlerSlot::Tls(h) => h.on_stopped(&TlsServer { core: self.clone() }),
        }
    }

    fn emit_connected(self: &Arc<Self>, session: &Arc<SessionCore>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            ServerHandlerSlot::Tcp(h) => h.on_connected(
                &TcpServer { core: self.clone() },
                &TcpSession { core: session.clone() },
            ),
            ServerHandlerSlot::Tls(h) => h.on_connected(
                &TlsServer { core: self.clone() },
                &TlsSession { core: session.clone() },
            ),
        }
    }

    fn emit_disconnected(self: &Arc<Self>, session: &Arc<SessionCore>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            ServerHandlerSlot::Tcp(h) => h.on_disconnected(
                &TcpServer { core: self.clone() },
                &TcpSession { core: session.clone() },
            ),
            ServerHandlerSlot::Tls(h) => h.on_disconnected(
                &TlsServer { core: self.clone() },
                &TlsSession { core: session.clone() },
            ),
        }
    }

    fn emit_server_error(self: &Arc<Self>, error: &Error) {
        if error.is_cancelled() {
            return;
        }
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            ServerHandlerSlot::Tcp(h) => h.on_error(&TcpServer { core: self.clone() }, error),
            ServerHandlerSlot::Tls(h) => h.on_error(&TlsServer { core: self.clone() }, error),
        }
    }
}

impl ReadySource for ServerCore {
    fn on_ready(self: Arc<Self>, readable: bool, _writable: bool) {
        if readable && !self.pending_accept.swap(true, Ordering::AcqRel) {
            let core = self.clone();
            self.strand.post(move || core.process_accept());
        }
    }

    fn on_abort(self: Arc<Self>) {
        let core = self.clone();
        self.strand.post(move || {
            if core
                .state
                .compare_exchange(
                    ServerState::Started as u8,
                    ServerState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                core.close_listener();
                core.emit_stopped();
            }
        });
    }
}

macro_rules! server_handle_impl {
    ($name:ident, $session:ident) => {
        impl $name {
            /// Whether the server is listening.
            pub fn is_started(&self) -> bool {
                self.core.is_started()
            }

            /// Binds and starts accepting connections.
            pub fn start(&self) -> bool {
                self.core.start()
            }

            /// Stops accepting and disconnects every session.
            pub fn stop(&self) -> bool {
                self.core.stop()
            }

            /// Atomic stop + start preserving configuration.
            pub fn restart(&self) -> bool {
                self.core.restart()
            }

            /// Sends the payload to every current session. Per-session
            /// ordering only; sessions may observe the broadcast at
            /// different times.
            pub fn multicast(&self, data: &[u8]) -> bool {
                self.core.multicast(data)
            }

            /// Initiates a graceful close on every session.
            pub fn disconnect_all(&self) -> bool {
                self.core.disconnect_all()
            }

            /// Looks up a connected session by identifier.
            pub fn find_session(&self, id: SessionId) -> Option<$session> {
                self.core.find_session(id).map(|core| $session { core })
            }

            /// Number of sessions currently in the table.
            pub fn clients(&self) -> usize {
                self.core.clients()
            }

            /// Configured bind host.
            pub fn address(&self) -> &str {
                &self.core.address
            }

            /// Configured bind port.
            pub fn port(&self) -> u16 {
                self.core.port
            }

            /// Actual bound address once started.
            pub fn local_address(&self) -> Option<SocketAddr> {
                *self.core.local.lock().unwrap()
            }

            /// Aggregate payload bytes sent across all sessions.
            pub fn bytes_sent(&self) -> u64 {
                self.core.bytes_sent.load(Ordering::Relaxed)
            }

            /// Aggregate payload bytes received across all sessions.
            pub fn bytes_received(&self) -> u64 {
                self.core.bytes_received.load(Ordering::Relaxed)
            }

            /// The service this server schedules onto.
            pub fn service(&self) -> &Service {
                &self.core.service
            }
        }
    };
}

/// A TCP server carrying many concurrent sessions.
///
/// Handles are cheap clones over a shared core; the embedder's
/// [`TcpServerHandler`] supplies per-session event sinks through its
/// `create_session` factory.
#[derive(Clone)]
pub struct TcpServer {
    pub(crate) core: Arc<ServerCore>,
}

impl TcpServer {
    /// Creates a stopped server bound to `address:port` when started.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        handler: Box<dyn TcpServerHandler>,
    ) -> Self {
        Self {
            core: ServerCore::new(
                service.clone(),
                address,
                port,
                None,
                ServerHandlerSlot::Tcp(handler),
            ),
        }
    }
}

/// A TLS server with the same fabric as [`TcpServer`]; every accepted
/// session handshakes with the supplied `rustls` configuration before
/// `on_connected` fires.
#[derive(Clone)]
pub struct TlsServer {
    pub(crate) core: Arc<ServerCore>,
}

impl TlsServer {
    /// Creates a stopped TLS server bound to `address:port` when
    /// started.
    pub fn new(
        service: &Service,
        address: &str,
        port: u16,
        tls_config: Arc<TlsServerConfig>,
        handler: Box<dyn TlsServerHandler>,
    ) -> Self {
        Self {
            core: ServerCore::new(
                service.clone(),
                address,
                port,
                Some(tls_config),
                ServerHandlerSlot::Tls(handler),
            ),
        }
    }
}

server_handle_impl!(TcpServer, TcpSession);
server_handle_impl!(TlsServer, TlsSession);
