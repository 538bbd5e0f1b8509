//! Stream session: lifecycle, buffered I/O and event emission.
//!
//! One [`SessionCore`] carries both plain TCP and TLS sessions; the
//! difference is confined to the [`Engine`], which transforms bytes
//! between the socket and the plaintext regions. Public handles
//! ([`TcpSession`], [`TlsSession`]) are cheap clones over the core.
//!
//! Locking discipline: stream, engine and recv are touched only from
//! strand jobs; the send region may be touched from any thread but
//! nothing acquires the handler lock while holding it. Handler
//! callbacks may call `send_async` and the `*_async` lifecycle
//! operations; everything else they might reach only posts.

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    time::Duration,
};

use mio::{net::TcpStream, Interest, Token};
use rustls::Connection as TlsConnection;
use tracing::{debug, trace};

use streamwarp_core::{
    buffer::{RecvBuffer, SendBuffer},
    config::Config,
    error::Error,
    id::SessionId,
};
use streamwarp_service::{ReadySource, Service, Strand};

use crate::{
    handler::{TcpSessionHandler, TlsSessionHandler},
    server::ServerCore,
};

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SessionState {
    /// Connecting or handshaking.
    Pending = 0,
    /// Fully established.
    Connected = 1,
    /// Teardown in progress on the strand.
    Disconnecting = 2,
    /// Closed; terminal until a client reconnects.
    Disconnected = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Pending,
            1 => SessionState::Connected,
            2 => SessionState::Disconnecting,
            _ => SessionState::Disconnected,
        }
    }
}

/// Byte transformation between the socket and the plaintext regions.
pub(crate) enum Engine {
    /// Bytes pass through untouched.
    Plain,
    /// A TLS record engine sits in the middle.
    Tls(Box<TlsConnection>),
}

/// The embedder's event sink, typed by session flavor.
pub(crate) enum HandlerSlot {
    Tcp(Box<dyn TcpSessionHandler>),
    Tls(Box<dyn TlsSessionHandler>),
}

struct RecvState {
    buffer: RecvBuffer,
}

struct SendState {
    buffer: SendBuffer,
    /// A flush job is scheduled or a writable event is awaited.
    sending: bool,
    /// Emit `on_empty` next time the region fully drains.
    notify_empty: bool,
}

/// Outcome of an I/O pump, decided under locks and acted on after
/// they are released.
enum PumpOutcome {
    Continue,
    Eof,
    Failed(Error),
}

pub(crate) struct SessionCore {
    id: SessionId,
    service: Service,
    strand: Strand,
    config: Config,
    server: Weak<ServerCore>,
    stream: Mutex<Option<TcpStream>>,
    token: Mutex<Option<Token>>,
    engine: Mutex<Engine>,
    state: AtomicU8,
    /// TLS handshake finished (always true for plain sessions once
    /// connected).
    handshaken: AtomicBool,
    /// `on_connected` was emitted; gates the matching `on_disconnected`.
    connected_reported: AtomicBool,
    /// Client connect still awaiting writability.
    connecting: AtomicBool,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    handler: Mutex<HandlerSlot>,
    peer: Mutex<Option<SocketAddr>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Coalesce readiness notifications into one strand job each.
    pending_read: AtomicBool,
    pending_write: AtomicBool,
    /// Pairs with the send mutex; signaled when the region drains or
    /// the session closes, unblocking synchronous senders.
    drained: Condvar,
    /// Pairs with the lifecycle mutex; signaled on state changes,
    /// unblocking synchronous connect/disconnect.
    lifecycle: Mutex<()>,
    lifecycle_changed: Condvar,
}

impl SessionCore {
    pub(crate) fn new(
        service: Service,
        config: Config,
        server: Weak<ServerCore>,
        handler: HandlerSlot,
    ) -> Arc<Self> {
        let strand = service.strand();
        Arc::new(Self {
            id: SessionId::generate(),
            service,
            strand,
            recv: Mutex::new(RecvState {
                buffer: RecvBuffer::new(config.receive_buffer_initial, config.receive_buffer_limit),
            }),
            send: Mutex::new(SendState {
                buffer: SendBuffer::new(config.send_buffer_limit),
                sending: false,
                notify_empty: false,
            }),
            config,
            server,
            stream: Mutex::new(None),
            token: Mutex::new(None),
            engine: Mutex::new(Engine::Plain),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            handshaken: AtomicBool::new(false),
            connected_reported: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            handler: Mutex::new(handler),
            peer: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            pending_read: AtomicBool::new(false),
            pending_write: AtomicBool::new(false),
            drained: Condvar::new(),
            lifecycle: Mutex::new(()),
            lifecycle_changed: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn service(&self) -> &Service {
        &self.service
    }

    pub(crate) fn strand(&self) -> &Strand {
        &self.strand
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
        let _guard = self.lifecycle.lock().unwrap();
        self.lifecycle_changed.notify_all();
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn peer_address(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap()
    }

    /// Blocks the caller until the session leaves `Pending`.
    pub(crate) fn wait_lifecycle(&self, leave: SessionState) {
        let mut guard = self.lifecycle.lock().unwrap();
        while self.state() == leave {
            let (next, _) = self
                .lifecycle_changed
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
            guard = next;
        }
    }

    // ---------------------------------------------------------------
    // Connection establishment
    // ---------------------------------------------------------------

    /// Adopts an accepted socket on the session strand: applies socket
    /// options, installs the engine, registers with the reactor and
    /// reports the connection (TLS sessions report only after the
    /// handshake).
    pub(crate) fn adopt_accepted(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        tls: Option<Box<TlsConnection>>,
    ) {
        if let Err(e) = apply_stream_options(&stream, &self.config) {
            self.emit_error(&Error::Transport(e));
        }
        *self.peer.lock().unwrap() = Some(peer);
        let is_tls = tls.is_some();
        if let Some(conn) = tls {
            *self.engine.lock().unwrap() = Engine::Tls(conn);
        }
        self.set_state(SessionState::Pending);
        let ready: Arc<dyn ReadySource> = self.clone();
        let token = match self.service.register_source(
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
            ready,
        ) {
            Ok(token) => token,
            Err(e) => {
                self.emit_error(&Error::Transport(e));
                self.set_state(SessionState::Disconnected);
                if let Some(server) = self.server.upgrade() {
                    server.session_disconnected(self.clone(), false);
                }
                return;
            }
        };
        *self.token.lock().unwrap() = Some(token);
        *self.stream.lock().unwrap() = Some(stream);
        if is_tls {
            // First flight may already be buffered by the peer.
            self.pump_engine_writes();
            self.process_read();
        } else {
            self.handshaken.store(true, Ordering::Release);
            self.mark_connected();
            self.process_read();
        }
    }

    /// Finalizes a client connect on the session strand once the socket
    /// reports writability.
    fn complete_connect(self: &Arc<Self>) {
        if !self.connecting.load(Ordering::Acquire) {
            return;
        }
        let verdict = {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return;
            };
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(addr) => Ok(addr),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::NotConnected
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        return; // spurious wakeup, keep waiting
                    }
                    Err(e) => Err(e),
                },
            }
        };
        self.connecting.store(false, Ordering::Release);
        match verdict {
            Ok(addr) => {
                *self.peer.lock().unwrap() = Some(addr);
                if let Some(stream) = self.stream.lock().unwrap().as_ref() {
                    if let Err(e) = apply_stream_options(stream, &self.config) {
                        self.emit_error(&Error::Transport(e));
                    }
                }
                let tls_pending = {
                    let engine = self.engine.lock().unwrap();
                    matches!(&*engine, Engine::Tls(_))
                };
                if tls_pending {
                    self.pump_engine_writes();
                } else {
                    self.handshaken.store(true, Ordering::Release);
                    self.mark_connected();
                    self.process_read();
                }
            }
            Err(e) => {
                debug!(session = %self.id, "connect failed: {}", e);
                self.emit_error(&Error::Transport(e));
                self.teardown();
                self.set_state(SessionState::Disconnected);
            }
        }
    }

    /// Initiates a client connection on the session strand.
    pub(crate) fn start_connect(
        self: &Arc<Self>,
        address: SocketAddr,
        tls: Option<Box<TlsConnection>>,
    ) {
        self.emit_connecting();
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        {
            let mut send = self.send.lock().unwrap();
            send.buffer.clear();
            send.sending = false;
        }
        if let Some(conn) = tls {
            *self.engine.lock().unwrap() = Engine::Tls(conn);
        } else {
            *self.engine.lock().unwrap() = Engine::Plain;
        }
        self.handshaken.store(false, Ordering::Release);
        self.connected_reported.store(false, Ordering::Release);
        let mut stream = match TcpStream::connect(address) {
            Ok(stream) => stream,
            Err(e) => {
                self.emit_error(&Error::Transport(e));
                self.set_state(SessionState::Disconnected);
                return;
            }
        };
        self.connecting.store(true, Ordering::Release);
        let ready: Arc<dyn ReadySource> = self.clone();
        let token = match self.service.register_source(
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
            ready,
        ) {
            Ok(token) => token,
            Err(e) => {
                self.connecting.store(false, Ordering::Release);
                self.emit_error(&Error::Transport(e));
                self.set_state(SessionState::Disconnected);
                return;
            }
        };
        *self.token.lock().unwrap() = Some(token);
        *self.stream.lock().unwrap() = Some(stream);
    }

    /// Marks the session connected and reports it: session handler
    /// first, then the owning server on its own strand.
    pub(crate) fn mark_connected(self: &Arc<Self>) {
        self.set_state(SessionState::Connected);
        self.connected_reported.store(true, Ordering::Release);
        self.emit_connected();
        if let Some(server) = self.server.upgrade() {
            server.session_connected(self.clone());
        }
    }

    // ---------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------

    /// Drains the socket into the receive region, emitting
    /// `on_received` per chunk. Runs on the session strand.
    fn process_read(self: &Arc<Self>) {
        self.pending_read.store(false, Ordering::Release);
        let state = self.state();
        if state != SessionState::Connected && state != SessionState::Pending {
            return;
        }
        let outcome = {
            let mut stream_guard = self.stream.lock().unwrap();
            let Some(stream) = stream_guard.as_mut() else {
                return;
            };
            let mut engine = self.engine.lock().unwrap();
            match &mut *engine {
                Engine::Plain => {
                    if !self.handshaken.load(Ordering::Acquire) {
                        return;
                    }
                    self.pump_plain_reads(stream)
                }
                Engine::Tls(conn) => self.pump_tls_reads(stream, conn),
            }
        };
        self.conclude_pump(outcome);
    }

    fn pump_plain_reads(self: &Arc<Self>, stream: &mut TcpStream) -> PumpOutcome {
        let mut recv = self.recv.lock().unwrap();
        loop {
            let buf = recv.buffer.as_mut_slice();
            match stream.read(buf) {
                Ok(0) => return PumpOutcome::Eof,
                Ok(n) => {
                    let filled = n == buf.len();
                    self.account_received(n as u64);
                    self.emit_received(&recv.buffer.as_mut_slice()[..n]);
                    if filled {
                        recv.buffer.grow();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return PumpOutcome::Continue
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return PumpOutcome::Failed(Error::Transport(e)),
            }
        }
    }

    fn pump_tls_reads(
        self: &Arc<Self>,
        stream: &mut TcpStream,
        conn: &mut TlsConnection,
    ) -> PumpOutcome {
        loop {
            match conn.read_tls(stream) {
                Ok(0) => return PumpOutcome::Eof,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return PumpOutcome::Continue
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return PumpOutcome::Failed(Error::Transport(e)),
            }
            let io_state = match conn.process_new_packets() {
                Ok(io_state) => io_state,
                Err(e) => {
                    // Flush the alert describing the failure if possible.
                    let _ = conn.write_tls(stream);
                    return PumpOutcome::Failed(Error::Tls(e.to_string()));
                }
            };
            // Connected must be reported before any plaintext that
            // arrived in the same record flight.
            if !conn.is_handshaking()
                && !self.handshaken.swap(true, Ordering::AcqRel)
                && self.state() == SessionState::Pending
            {
                self.emit_handshaked();
                self.mark_connected();
                self.schedule_flush_if_pending();
            }
            if io_state.plaintext_bytes_to_read() > 0 {
                let mut recv = self.recv.lock().unwrap();
                loop {
                    let buf = recv.buffer.as_mut_slice();
                    match conn.reader().read(buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let filled = n == buf.len();
                            self.account_received(n as u64);
                            self.emit_received(&recv.buffer.as_mut_slice()[..n]);
                            if filled {
                                recv.buffer.grow();
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
            }
            while conn.wants_write() {
                match conn.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return PumpOutcome::Failed(Error::Transport(e)),
                }
            }
            if io_state.peer_has_closed() {
                return PumpOutcome::Eof;
            }
        }
    }

    fn conclude_pump(self: &Arc<Self>, outcome: PumpOutcome) {
        match outcome {
            PumpOutcome::Continue => {}
            PumpOutcome::Eof => self.process_disconnect(),
            PumpOutcome::Failed(error) => {
                if !error.is_cancelled() {
                    self.emit_error(&error);
                }
                self.process_disconnect();
            }
        }
    }

    // ---------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------

    /// Appends bytes to the send region and schedules a flush.
    /// Callable from any thread. Fails when the session is not
    /// connected or the region would exceed its limit.
    pub(crate) fn send_async(self: &Arc<Self>, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        let schedule = {
            let mut send = self.send.lock().unwrap();
            if !send.buffer.push(data) {
                let report = send.buffer.note_overflow();
                let error = Error::BufferOverflow {
                    pending: send.buffer.pending(),
                    limit: send.buffer.limit(),
                };
                drop(send);
                if report {
                    let core = self.clone();
                    self.strand.post(move || core.emit_error(&error));
                }
                return false;
            }
            if send.sending {
                false
            } else {
                send.sending = true;
                true
            }
        };
        if schedule {
            let core = self.clone();
            self.strand.post(move || core.process_flush());
        }
        true
    }

    /// Synchronous send: enqueues and blocks the caller until the
    /// region drains or the session closes. Illegal on worker threads.
    pub(crate) fn send(self: &Arc<Self>, data: &[u8]) -> usize {
        if Service::is_worker_thread() {
            let core = self.clone();
            self.strand.post(move || {
                core.emit_error(&Error::InvalidState("synchronous send on a worker thread"))
            });
            return 0;
        }
        if !self.send_async(data) {
            return 0;
        }
        let mut send = self.send.lock().unwrap();
        while !send.buffer.is_empty() && self.is_connected() {
            let (next, _) = self.drained.wait_timeout(send, Duration::from_millis(10)).unwrap();
            send = next;
        }
        if send.buffer.is_empty() {
            data.len()
        } else {
            0
        }
    }

    /// Flushes the send region to the socket. Runs on the session
    /// strand; writability events resume it after `WouldBlock`.
    fn process_flush(self: &Arc<Self>) {
        if self.state() != SessionState::Connected {
            return;
        }
        if !self.handshaken.load(Ordering::Acquire) {
            return;
        }
        let (outcome, wrote, pending, emit_empty) = {
            let mut stream_guard = self.stream.lock().unwrap();
            let Some(stream) = stream_guard.as_mut() else {
                return;
            };
            let mut engine = self.engine.lock().unwrap();
            let mut send = self.send.lock().unwrap();
            let (outcome, wrote) = match &mut *engine {
                Engine::Plain => pump_plain_writes(stream, &mut send.buffer),
                Engine::Tls(conn) => pump_tls_writes(stream, conn, &mut send.buffer),
            };
            let pending = send.buffer.pending();
            let blocked = matches!(outcome, PumpOutcome::Continue) && pending > 0;
            send.sending = blocked;
            let emit_empty = pending == 0 && send.notify_empty;
            if emit_empty {
                send.notify_empty = false;
            }
            (outcome, wrote, pending, emit_empty)
        };
        if wrote > 0 {
            self.account_sent(wrote as u64);
            self.emit_sent(wrote, pending);
        }
        if pending == 0 {
            let _send = self.send.lock().unwrap();
            self.drained.notify_all();
        }
        if emit_empty {
            self.emit_empty();
        }
        match outcome {
            PumpOutcome::Continue => {}
            PumpOutcome::Eof => self.process_disconnect(),
            PumpOutcome::Failed(error) => {
                if !error.is_cancelled() {
                    self.emit_error(&error);
                }
                self.process_disconnect();
            }
        }
    }

    /// Re-schedules a flush after the handshake completes in case the
    /// embedder queued data from `on_connected`.
    fn schedule_flush_if_pending(self: &Arc<Self>) {
        let schedule = {
            let mut send = self.send.lock().unwrap();
            if send.buffer.is_empty() || send.sending {
                false
            } else {
                send.sending = true;
                true
            }
        };
        if schedule {
            let core = self.clone();
            self.strand.post(move || core.process_flush());
        }
    }

    /// Drives buffered TLS records out (handshake flights, alerts,
    /// app-data records the engine accepted). Runs on the strand.
    fn pump_engine_writes(self: &Arc<Self>) {
        let outcome = {
            let mut stream_guard = self.stream.lock().unwrap();
            let Some(stream) = stream_guard.as_mut() else {
                return;
            };
            let mut engine = self.engine.lock().unwrap();
            let Engine::Tls(conn) = &mut *engine else {
                return;
            };
            let mut outcome = PumpOutcome::Continue;
            while conn.wants_write() {
                match conn.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        outcome = PumpOutcome::Failed(Error::Transport(e));
                        break;
                    }
                }
            }
            outcome
        };
        self.conclude_pump(outcome);
    }

    pub(crate) fn set_send_buffer_limit(&self, limit: usize) {
        self.send.lock().unwrap().buffer.set_limit(limit);
    }

    pub(crate) fn send_buffer_limit(&self) -> usize {
        self.send.lock().unwrap().buffer.limit()
    }

    pub(crate) fn set_receive_buffer_limit(&self, limit: usize) {
        self.recv.lock().unwrap().buffer.set_limit(limit);
    }

    pub(crate) fn receive_buffer_limit(&self) -> usize {
        self.recv.lock().unwrap().buffer.limit()
    }

    /// Requests a one-shot `on_empty` when the send region drains.
    pub(crate) fn request_empty_notification(self: &Arc<Self>) {
        let already_empty = {
            let mut send = self.send.lock().unwrap();
            if send.buffer.is_empty() {
                true
            } else {
                send.notify_empty = true;
                false
            }
        };
        if already_empty {
            let core = self.clone();
            self.strand.post(move || core.emit_empty());
        }
    }

    // ---------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------

    /// Posts a graceful close onto the session strand.
    pub(crate) fn disconnect_async(self: &Arc<Self>) -> bool {
        let state = self.state();
        if state == SessionState::Disconnected || state == SessionState::Disconnecting {
            return false;
        }
        let core = self.clone();
        self.strand.post(move || core.process_disconnect())
    }

    /// Synchronous close: initiates and blocks until the session is
    /// fully disconnected. Illegal on worker threads (returns false
    /// after initiating).
    pub(crate) fn disconnect(self: &Arc<Self>) -> bool {
        if !self.disconnect_async() {
            return false;
        }
        if Service::is_worker_thread() {
            return false;
        }
        self.wait_lifecycle(SessionState::Disconnecting);
        while self.state() != SessionState::Disconnected {
            let guard = self.lifecycle.lock().unwrap();
            let _ = self
                .lifecycle_changed
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
        true
    }

    /// Full teardown on the session strand. Safe to run repeatedly;
    /// only the first run does work.
    fn process_disconnect(self: &Arc<Self>) {
        let state = self.state();
        if state == SessionState::Disconnected || state == SessionState::Disconnecting {
            return;
        }
        self.set_state(SessionState::Disconnecting);
        self.emit_disconnecting();

        // Send a close_notify when the engine still can.
        {
            let mut stream_guard = self.stream.lock().unwrap();
            if let Some(stream) = stream_guard.as_mut() {
                let mut engine = self.engine.lock().unwrap();
                if let Engine::Tls(conn) = &mut *engine {
                    conn.send_close_notify();
                    let _ = conn.write_tls(stream);
                }
            }
        }
        self.teardown();

        self.set_state(SessionState::Disconnected);
        {
            let _send = self.send.lock().unwrap();
            self.drained.notify_all();
        }
        let was_connected = self.connected_reported.swap(false, Ordering::AcqRel);
        if was_connected {
            self.emit_disconnected();
        }
        if let Some(server) = self.server.upgrade() {
            server.session_disconnected(self.clone(), was_connected);
        }
        trace!(session = %self.id, "session disconnected");
    }

    /// Deregisters and drops the socket, clears the regions.
    fn teardown(&self) {
        let token = self.token.lock().unwrap().take();
        let mut stream_guard = self.stream.lock().unwrap();
        if let Some(mut stream) = stream_guard.take() {
            if let Some(token) = token {
                self.service.deregister_source(&mut stream, token);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        drop(stream_guard);
        self.connecting.store(false, Ordering::Release);
        self.handshaken.store(false, Ordering::Release);
        *self.engine.lock().unwrap() = Engine::Plain;
        let mut send = self.send.lock().unwrap();
        send.buffer.clear();
        send.sending = false;
        send.notify_empty = false;
    }

    // ---------------------------------------------------------------
    // Counters
    // ---------------------------------------------------------------

    fn account_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        if let Some(server) = self.server.upgrade() {
            server.account_received(n);
        }
    }

    fn account_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        if let Some(server) = self.server.upgrade() {
            server.account_sent(n);
        }
    }

    // ---------------------------------------------------------------
    // Event emission (always on the session strand)
    // ---------------------------------------------------------------

    fn tcp_handle(self: &Arc<Self>) -> TcpSession {
        TcpSession { core: self.clone() }
    }

    fn tls_handle(self: &Arc<Self>) -> TlsSession {
        TlsSession { core: self.clone() }
    }

    fn emit_connecting(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_connecting(&self.tcp_handle()),
            HandlerSlot::Tls(h) => h.on_connecting(&self.tls_handle()),
        }
    }

    fn emit_connected(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_connected(&self.tcp_handle()),
            HandlerSlot::Tls(h) => h.on_connected(&self.tls_handle()),
        }
    }

    fn emit_handshaked(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        if let HandlerSlot::Tls(h) = &mut *slot {
            h.on_handshaked(&self.tls_handle());
        }
    }

    fn emit_disconnecting(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_disconnecting(&self.tcp_handle()),
            HandlerSlot::Tls(h) => h.on_disconnecting(&self.tls_handle()),
        }
    }

    fn emit_disconnected(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_disconnected(&self.tcp_handle()),
            HandlerSlot::Tls(h) => h.on_disconnected(&self.tls_handle()),
        }
    }

    fn emit_received(self: &Arc<Self>, data: &[u8]) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_received(&self.tcp_handle(), data),
            HandlerSlot::Tls(h) => h.on_received(&self.tls_handle(), data),
        }
    }

    fn emit_sent(self: &Arc<Self>, sent: usize, pending: usize) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_sent(&self.tcp_handle(), sent, pending),
            HandlerSlot::Tls(h) => h.on_sent(&self.tls_handle(), sent, pending),
        }
    }

    fn emit_empty(self: &Arc<Self>) {
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_empty(&self.tcp_handle()),
            HandlerSlot::Tls(h) => h.on_empty(&self.tls_handle()),
        }
    }

    pub(crate) fn emit_error(self: &Arc<Self>, error: &Error) {
        if error.is_cancelled() {
            return;
        }
        let mut slot = self.handler.lock().unwrap();
        match &mut *slot {
            HandlerSlot::Tcp(h) => h.on_error(&self.tcp_handle(), error),
            HandlerSlot::Tls(h) => h.on_error(&self.tls_handle(), error),
        }
    }
}

impl ReadySource for SessionCore {
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool) {
        if readable && !self.pending_read.swap(true, Ordering::AcqRel) {
            let core = self.clone();
            self.strand.post(move || core.process_read());
        }
        if writable && !self.pending_write.swap(true, Ordering::AcqRel) {
            let core = self.clone();
            self.strand.post(move || core.process_write());
        }
    }

    fn on_abort(self: Arc<Self>) {
        let core = self.clone();
        self.strand.post(move || core.process_disconnect());
    }
}

impl SessionCore {
    /// Writability: complete a pending connect, push handshake
    /// records, then resume a blocked flush. Runs on the strand.
    fn process_write(self: &Arc<Self>) {
        self.pending_write.store(false, Ordering::Release);
        if self.connecting.load(Ordering::Acquire) {
            self.complete_connect();
        }
        let tls = {
            let engine = self.engine.lock().unwrap();
            matches!(&*engine, Engine::Tls(_))
        };
        if tls {
            self.pump_engine_writes();
        }
        let resume = {
            let send = self.send.lock().unwrap();
            send.sending && !send.buffer.is_empty()
        };
        if resume {
            self.process_flush();
        }
    }
}

fn pump_plain_writes(stream: &mut TcpStream, buffer: &mut SendBuffer) -> (PumpOutcome, usize) {
    let mut wrote = 0;
    loop {
        if !buffer.prepare_flush() {
            return (PumpOutcome::Continue, wrote);
        }
        match stream.write(buffer.flush_chunk()) {
            Ok(0) => return (PumpOutcome::Eof, wrote),
            Ok(n) => {
                buffer.consume(n);
                wrote += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return (PumpOutcome::Continue, wrote)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return (PumpOutcome::Failed(Error::Transport(e)), wrote),
        }
    }
}

fn pump_tls_writes(
    stream: &mut TcpStream,
    conn: &mut TlsConnection,
    buffer: &mut SendBuffer,
) -> (PumpOutcome, usize) {
    let mut wrote = 0;
    loop {
        let mut progressed = false;
        if buffer.prepare_flush() {
            match conn.writer().write(buffer.flush_chunk()) {
                Ok(0) => {}
                Ok(n) => {
                    buffer.consume(n);
                    wrote += n;
                    progressed = true;
                }
                Err(e) => return (PumpOutcome::Failed(Error::Tls(e.to_string())), wrote),
            }
        }
        while conn.wants_write() {
            match conn.write_tls(stream) {
                Ok(0) => return (PumpOutcome::Eof, wrote),
                Ok(_) => progressed = true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return (PumpOutcome::Continue, wrote)
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return (PumpOutcome::Failed(Error::Transport(e)), wrote),
            }
        }
        if !progressed {
            return (PumpOutcome::Continue, wrote);
        }
    }
}

/// Applies configured socket options to a connected stream.
pub(crate) fn apply_stream_options(stream: &TcpStream, config: &Config) -> std::io::Result<()> {
    if config.no_delay {
        stream.set_nodelay(true)?;
    }
    let sock = socket2::SockRef::from(stream);
    if config.keep_alive {
        sock.set_keepalive(true)?;
    }
    if let Some(size) = config.socket_recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// A connected TCP stream endpoint.
///
/// Handles are cheap clones; the underlying session lives while its
/// owner (server table or client) or an outstanding operation holds it.
#[derive(Clone)]
pub struct TcpSession {
    pub(crate) core: Arc<SessionCore>,
}

/// A connected TLS stream endpoint with the same surface as
/// [`TcpSession`]; sizes and buffers are plaintext.
#[derive(Clone)]
pub struct TlsSession {
    pub(crate) core: Arc<SessionCore>,
}

macro_rules! session_handle_impl {
    ($name:ident) => {
        impl $name {
            /// Stable identifier assigned at construction.
            pub fn id(&self) -> SessionId {
                self.core.id()
            }

            /// The service this session schedules onto.
            pub fn service(&self) -> &Service {
                self.core.service()
            }

            /// Whether the session is fully established.
            pub fn is_connected(&self) -> bool {
                self.core.is_connected()
            }

            /// Total payload bytes sent over the lifetime of the
            /// session. Monotonic.
            pub fn bytes_sent(&self) -> u64 {
                self.core.bytes_sent()
            }

            /// Total payload bytes received over the lifetime of the
            /// session. Monotonic.
            pub fn bytes_received(&self) -> u64 {
                self.core.bytes_received()
            }

            /// Remote address, when connected.
            pub fn peer_address(&self) -> Option<SocketAddr> {
                self.core.peer_address()
            }

            /// Appends bytes to the send region and schedules a flush.
            /// Callable from any thread; returns `false` when not
            /// connected or when the region would exceed its limit.
            pub fn send_async(&self, data: &[u8]) -> bool {
                self.core.send_async(data)
            }

            /// Synchronous send: blocks the caller until the region
            /// drains. Illegal on worker threads (returns 0).
            pub fn send(&self, data: &[u8]) -> usize {
                self.core.send(data)
            }

            /// Initiates a graceful close.
            pub fn disconnect_async(&self) -> bool {
                self.core.disconnect_async()
            }

            /// Synchronous close: initiates and blocks until the
            /// session is torn down. Illegal on worker threads, where
            /// it only initiates and returns `false`.
            pub fn disconnect(&self) -> bool {
                self.core.disconnect()
            }

            /// Requests a one-shot `on_empty` when the send region
            /// drains.
            pub fn request_empty_notification(&self) {
                self.core.request_empty_notification()
            }

            /// Max pending bytes in the send region (0 = unbounded).
            pub fn send_buffer_limit(&self) -> usize {
                self.core.send_buffer_limit()
            }

            /// Replaces the send region limit.
            pub fn set_send_buffer_limit(&self, limit: usize) {
                self.core.set_send_buffer_limit(limit)
            }

            /// Max size the receive region may grow to (0 = unbounded).
            pub fn receive_buffer_limit(&self) -> usize {
                self.core.receive_buffer_limit()
            }

            /// Replaces the receive region growth limit.
            pub fn set_receive_buffer_limit(&self, limit: usize) {
                self.core.set_receive_buffer_limit(limit)
            }

            /// Runs a job serialized with this session's callbacks.
            pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
                self.core.strand().post(job)
            }
        }
    };
}

session_handle_impl!(TcpSession);
session_handle_impl!(TlsSession);
