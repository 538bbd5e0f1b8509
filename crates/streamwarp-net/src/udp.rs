//! Datagram endpoint with optional multicast group membership.

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use mio::{net::UdpSocket as MioUdpSocket, Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use streamwarp_core::{buffer::RecvBuffer, config::Config, error::Error};
use streamwarp_service::{ReadySource, Service, Strand};

use crate::handler::UdpSocketHandler;

struct UdpSendState {
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
    queued_bytes: usize,
    sending: bool,
    overflow: bool,
}

struct UdpCore {
    service: Service,
    config: Config,
    strand: Strand,
    bind_address: SocketAddr,
    socket: Mutex<Option<MioUdpSocket>>,
    token: Mutex<Option<Token>>,
    handler: Mutex<Box<dyn UdpSocketHandler>>,
    recv: Mutex<RecvBuffer>,
    send: Mutex<UdpSendState>,
    peer: Mutex<Option<SocketAddr>>,
    bound: AtomicBool,
    /// Receive events are only delivered after `receive_async`.
    receiving: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    pending_read: AtomicBool,
    pending_write: AtomicBool,
}

/// A datagram endpoint bound to a service.
///
/// Each datagram is independent; there is no session fabric. Receive
/// completions surface as `on_received(endpoint, bytes)` once
/// [`UdpSocket::receive_async`] enabled delivery.
#[derive(Clone)]
pub struct UdpSocket {
    core: Arc<UdpCore>,
}

impl UdpSocket {
    /// Creates an unbound endpoint for `address`.
    pub fn new(service: &Service, address: SocketAddr, handler: Box<dyn UdpSocketHandler>) -> Self {
        let strand = service.strand();
        let config = service.config().clone();
        Self {
            core: Arc::new(UdpCore {
                service: service.clone(),
                strand,
                recv: Mutex::new(RecvBuffer::new(
                    config.receive_buffer_initial,
                    config.receive_buffer_limit,
                )),
                send: Mutex::new(UdpSendState {
                    queue: VecDeque::new(),
                    queued_bytes: 0,
                    sending: false,
                    overflow: false,
                }),
                config,
                bind_address: address,
                socket: Mutex::new(None),
                token: Mutex::new(None),
                handler: Mutex::new(handler),
                peer: Mutex::new(None),
                bound: AtomicBool::new(false),
                receiving: AtomicBool::new(false),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                datagrams_sent: AtomicU64::new(0),
                datagrams_received: AtomicU64::new(0),
                pending_read: AtomicBool::new(false),
                pending_write: AtomicBool::new(false),
            }),
        }
    }

    /// Binds the socket and registers it with the reactor.
    pub fn bind(&self) -> bool {
        if self.core.bound.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.core.bind_socket() {
            Ok(()) => {
                let core = self.core.clone();
                self.core.strand.post(move || core.emit_started());
                true
            }
            Err(e) => {
                self.core.bound.store(false, Ordering::Release);
                let core = self.core.clone();
                let error = Error::Transport(e);
                self.core.strand.post(move || core.emit_error(&error));
                false
            }
        }
    }

    /// Closes the socket and stops event delivery.
    pub fn close(&self) -> bool {
        if !self.core.bound.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.core.receiving.store(false, Ordering::Release);
        let core = self.core.clone();
        self.core.strand.post(move || {
            core.teardown();
            core.emit_stopped();
        });
        true
    }

    /// Remembers a default destination for [`UdpSocket::send_async`].
    pub fn connect(&self, endpoint: SocketAddr) {
        *self.core.peer.lock().unwrap() = Some(endpoint);
    }

    /// Joins an IP multicast group on this socket.
    pub fn join_multicast_group(&self, group: IpAddr) -> bool {
        self.core.multicast_membership(group, true)
    }

    /// Leaves an IP multicast group.
    pub fn leave_multicast_group(&self, group: IpAddr) -> bool {
        self.core.multicast_membership(group, false)
    }

    /// Enables receive delivery; datagrams surface via `on_received`
    /// until the socket closes.
    pub fn receive_async(&self) -> bool {
        if !self.core.bound.load(Ordering::Acquire) {
            return false;
        }
        if self.core.receiving.swap(true, Ordering::AcqRel) {
            return true;
        }
        let core = self.core.clone();
        self.core.strand.post(move || core.process_read());
        true
    }

    /// Queues one datagram to an explicit destination.
    pub fn send_to_async(&self, endpoint: SocketAddr, data: &[u8]) -> bool {
        self.core.send_to_async(endpoint, data)
    }

    /// Queues one datagram to the connected destination.
    pub fn send_async(&self, data: &[u8]) -> bool {
        let Some(endpoint) = *self.core.peer.lock().unwrap() else {
            let core = self.core.clone();
            self.core.strand.post(move || {
                core.emit_error(&Error::InvalidState("send without a connected endpoint"))
            });
            return false;
        };
        self.core.send_to_async(endpoint, data)
    }

    /// Synchronous datagram send to an explicit destination: retries
    /// past transient backpressure and returns the bytes handed to the
    /// kernel. Illegal on worker threads (returns 0).
    pub fn send_to(&self, endpoint: SocketAddr, data: &[u8]) -> usize {
        if Service::is_worker_thread() {
            return 0;
        }
        if !self.core.bound.load(Ordering::Acquire) {
            return 0;
        }
        loop {
            let result = {
                let socket = self.core.socket.lock().unwrap();
                let Some(socket) = socket.as_ref() else {
                    return 0;
                };
                socket.send_to(data, endpoint)
            };
            match result {
                Ok(n) => {
                    self.core.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.core.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    return n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_micros(100));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return 0,
            }
        }
    }

    /// Synchronous send to the connected destination.
    pub fn send(&self, data: &[u8]) -> usize {
        match *self.core.peer.lock().unwrap() {
            Some(endpoint) => self.send_to(endpoint, data),
            None => 0,
        }
    }

    /// Whether the socket is bound.
    pub fn is_bound(&self) -> bool {
        self.core.bound.load(Ordering::Acquire)
    }

    /// Actual bound address.
    pub fn local_address(&self) -> Option<SocketAddr> {
        let socket = self.core.socket.lock().unwrap();
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Total payload bytes sent. Monotonic.
    pub fn bytes_sent(&self) -> u64 {
        self.core.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total payload bytes received. Monotonic.
    pub fn bytes_received(&self) -> u64 {
        self.core.bytes_received.load(Ordering::Relaxed)
    }

    /// Total datagrams sent. Monotonic.
    pub fn datagrams_sent(&self) -> u64 {
        self.core.datagrams_sent.load(Ordering::Relaxed)
    }

    /// Total datagrams received. Monotonic.
    pub fn datagrams_received(&self) -> u64 {
        self.core.datagrams_received.load(Ordering::Relaxed)
    }
}

impl UdpCore {
    fn bind_socket(self: &Arc<Self>) -> std::io::Result<()> {
        let domain = if self.bind_address.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
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
        socket.bind(&self.bind_address.into())?;
        socket.set_nonblocking(true)?;
        let mut udp = MioUdpSocket::from_std(socket.into());
        let ready: Arc<dyn ReadySource> = self.clone();
        let token = self.service.register_source(
            &mut udp,
            Interest::READABLE | Interest::WRITABLE,
            ready,
        )?;
        *self.token.lock().unwrap() = Some(token);
        *self.socket.lock().unwrap() = Some(udp);
        debug!(address = %self.bind_address, "udp socket bound");
        Ok(())
    }

    fn teardown(&self) {
        let token = self.token.lock().unwrap().take();
        if let Some(mut socket) = self.socket.lock().unwrap().take() {
            if let Some(token) = token {
                self.service.deregister_source(&mut socket, token);
            }
        }
        let mut send = self.send.lock().unwrap();
        send.queue.clear();
        send.queued_bytes = 0;
        send.sending = false;
    }

    fn multicast_membership(self: &Arc<Self>, group: IpAddr, join: bool) -> bool {
        let socket = self.socket.lock().unwrap();
        let Some(socket) = socket.as_ref() else {
            return false;
        };
        let result = match group {
            IpAddr::V4(group) => {
                if join {
                    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                } else {
                    socket.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                }
            }
            IpAddr::V6(group) => {
                if join {
                    socket.join_multicast_v6(&group, 0)
                } else {
                    socket.leave_multicast_v6(&group, 0)
                }
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                let core = self.clone();
                let error = Error::Transport(e);
                self.strand.post(move || core.emit_error(&error));
                false
            }
        }
    }

    fn send_to_async(self: &Arc<Self>, endpoint: SocketAddr, data: &[u8]) -> bool {
        if !self.bound.load(Ordering::Acquire) {
            return false;
        }
        let schedule = {
            let mut send = self.send.lock().unwrap();
            let limit = self.config.send_buffer_limit;
            if limit > 0 && send.queued_bytes + data.len() > limit {
                let report = !send.overflow;
                send.overflow = true;
                let error = Error::BufferOverflow {
                    pending: send.queued_bytes,
                    limit,
                };
                drop(send);
                if report {
                    let core = self.clone();
                    self.strand.post(move || core.emit_error(&error));
                }
                return false;
            }
            send.overflow = false;
            send.queued_bytes += data.len();
            send.queue.push_back((endpoint, data.to_vec()));
            if send.sending {
                false
            } else {
                send.sending = true;
                true
            }
        };
        if schedule {
            let core = self.clone();
            self.strand.post(move || core.process_write());
        }
        true
    }

    /// Drains queued datagrams to the kernel. Runs on the strand.
    fn process_write(self: &Arc<Self>) {
        self.pending_write.store(false, Ordering::Release);
        loop {
            let next = {
                let mut send = self.send.lock().unwrap();
                match send.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        send.sending = false;
                        return;
                    }
                }
            };
            let (endpoint, payload) = next;
            let result = {
                let socket = self.socket.lock().unwrap();
                let Some(socket) = socket.as_ref() else {
                    return;
                };
                socket.send_to(&payload, endpoint)
            };
            match result {
                Ok(n) => {
                    self.send.lock().unwrap().queued_bytes -= payload.len();
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    self.emit_sent(endpoint, n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Requeue; writability resumes the drain.
                    let mut send = self.send.lock().unwrap();
                    send.queue.push_front((endpoint, payload));
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    let mut send = self.send.lock().unwrap();
                    send.queue.push_front((endpoint, payload));
                }
                Err(e) => {
                    self.send.lock().unwrap().queued_bytes -= payload.len();
                    self.emit_error(&Error::Transport(e));
                }
            }
        }
    }

    /// Drains arrived datagrams, one `on_received` each. Runs on the
    /// strand.
    fn process_read(self: &Arc<Self>) {
        self.pending_read.store(false, Ordering::Release);
        if !self.receiving.load(Ordering::Acquire) {
            return;
        }
        loop {
            let socket = self.socket.lock().unwrap();
            let Some(socket_ref) = socket.as_ref() else {
                return;
            };
            let mut recv = self.recv.lock().unwrap();
            let buf = recv.as_mut_slice();
            match socket_ref.recv_from(buf) {
                Ok((n, endpoint)) => {
                    let filled = n == buf.len();
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    self.emit_received(endpoint, &recv.as_mut_slice()[..n]);
                    if filled {
                        recv.grow();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(recv);
                    drop(socket);
                    self.emit_error(&Error::Transport(e));
                    return;
                }
            }
        }
    }

    fn handle(self: &Arc<Self>) -> UdpSocket {
        UdpSocket { core: self.clone() }
    }

    fn emit_started(self: &Arc<Self>) {
        self.handler.lock().unwrap().on_started(&self.handle());
    }

    fn emit_stopped(self: &Arc<Self>) {
        self.handler.lock().unwrap().on_stopped(&self.handle());
    }

    fn emit_received(self: &Arc<Self>, endpoint: SocketAddr, data: &[u8]) {
        self.handler.lock().unwrap().on_received(&self.handle(), endpoint, data);
    }

    fn emit_sent(self: &Arc<Self>, endpoint: SocketAddr, sent: usize) {
        self.handler.lock().unwrap().on_sent(&self.handle(), endpoint, sent);
    }

    fn emit_error(self: &Arc<Self>, error: &Error) {
        if error.is_cancelled() {
            return;
        }
        self.handler.lock().unwrap().on_error(&self.handle(), error);
    }
}

impl ReadySource for UdpCore {
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool) {
        if readable && !self.pending_read.swap(true, Ordering::AcqRel) {
            let core = self.clone();
            self.strand.post(move || core.process_read());
        }
        if writable && !self.pending_write.swap(true, Ordering::AcqRel) {
            let resume = {
                let send = self.send.lock().unwrap();
                send.sending
            };
            if resume {
                let core = self.clone();
                self.strand.post(move || core.process_write());
            } else {
                self.pending_write.store(false, Ordering::Release);
            }
        }
    }

    fn on_abort(self: Arc<Self>) {
        let core = self.clone();
        self.strand.post(move || {
            if core.bound.swap(false, Ordering::AcqRel) {
                core.receiving.store(false, Ordering::Release);
                core.teardown();
                core.emit_stopped();
            }
        });
    }
}
