//! Reactor internals: readiness dispatch and the timer queue.
//!
//! One thread owns the `mio::Poll` instance and blocks on it with a
//! timeout equal to the nearest timer deadline. Readiness events are
//! handed to the registered [`ReadySource`] bindings, which schedule
//! work onto their strands; the reactor thread itself never performs
//! endpoint I/O.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering as MemOrdering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace};

use crate::timer::TimerShared;

/// Token reserved for the reactor waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// A readiness-notification target registered with the reactor.
///
/// Implementations must only *schedule* work (typically onto their
/// strand); they run on the reactor thread and must not block or
/// perform socket I/O there.
pub trait ReadySource: Send + Sync {
    /// The registered source became readable and/or writable.
    fn on_ready(self: Arc<Self>, readable: bool, writable: bool);

    /// The service is shutting down; pending operations complete as
    /// aborted. Implementations map this to their terminal transition
    /// (sessions disconnect, servers stop) without reporting an error.
    fn on_abort(self: Arc<Self>);
}

/// Entry in the reactor's timer min-heap.
///
/// Cancellation is lazy: a stale generation or a dead `Weak` makes the
/// entry a no-op when popped.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) generation: u64,
    pub(crate) shared: Weak<TimerShared>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the earliest deadline surfaces on a max-heap.
        other.deadline.cmp(&self.deadline)
    }
}

/// State shared between the reactor thread and the rest of the service.
pub(crate) struct ReactorShared {
    registry: Mutex<Option<Registry>>,
    waker: Mutex<Option<Arc<Waker>>>,
    bindings: Mutex<HashMap<Token, Arc<dyn ReadySource>>>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    next_token: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
}

impl ReactorShared {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(None),
            waker: Mutex::new(None),
            bindings: Mutex::new(HashMap::new()),
            timers: Mutex::new(BinaryHeap::new()),
            next_token: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Installs the poll artifacts for a fresh run.
    pub(crate) fn install(&self, registry: Registry, waker: Arc<Waker>) {
        *self.registry.lock().unwrap() = Some(registry);
        *self.waker.lock().unwrap() = Some(waker);
        self.shutdown.store(false, MemOrdering::Release);
    }

    /// Drops the poll artifacts and every outstanding registration.
    pub(crate) fn teardown(&self) {
        self.bindings.lock().unwrap().clear();
        self.timers.lock().unwrap().clear();
        *self.registry.lock().unwrap() = None;
        *self.waker.lock().unwrap() = None;
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.registry.lock().unwrap().is_some()
    }

    /// Registers a source and binds its token to `ready`.
    ///
    /// The binding keeps a strong reference to the source's owner until
    /// deregistration, mirroring the rule that an outstanding operation
    /// holds its endpoint alive.
    pub(crate) fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interests: Interest,
        ready: Arc<dyn ReadySource>,
    ) -> io::Result<Token> {
        let registry = self.registry.lock().unwrap();
        let registry = registry
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "service is not started"))?;
        let token = Token(self.next_token.fetch_add(1, MemOrdering::Relaxed));
        registry.register(source, token, interests)?;
        self.bindings.lock().unwrap().insert(token, ready);
        trace!(token = token.0, "registered readiness source");
        Ok(token)
    }

    /// Deregisters a source and drops its binding.
    pub(crate) fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> bool {
        let removed = self.bindings.lock().unwrap().remove(&token).is_some();
        let registry = self.registry.lock().unwrap();
        if let Some(registry) = registry.as_ref() {
            if let Err(e) = registry.deregister(source) {
                debug!(token = token.0, "deregister failed: {}", e);
            }
        }
        removed
    }

    /// Takes every live binding, leaving the table empty.
    pub(crate) fn drain_bindings(&self) -> Vec<Arc<dyn ReadySource>> {
        self.bindings.lock().unwrap().drain().map(|(_, b)| b).collect()
    }

    /// Queues a timer deadline and wakes the reactor so it can shorten
    /// its poll timeout. Fails when the service is not running.
    pub(crate) fn schedule_timer(
        &self,
        deadline: Instant,
        generation: u64,
        shared: Weak<TimerShared>,
    ) -> bool {
        if !self.is_installed() {
            return false;
        }
        self.timers.lock().unwrap().push(TimerEntry { deadline, generation, shared });
        self.wake();
        true
    }

    /// Takes every queued timer entry, leaving the heap empty.
    pub(crate) fn drain_timers(&self) -> Vec<TimerEntry> {
        self.timers.lock().unwrap().drain().collect()
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            if let Err(e) = waker.wake() {
                error!("reactor wake failed: {}", e);
            }
        }
    }

    /// Duration until the nearest queued deadline, `None` when no
    /// timers are queued. Stale entries only cause an early wakeup.
    fn next_timeout(&self) -> Option<Duration> {
        let timers = self.timers.lock().unwrap();
        timers.peek().map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Pops and fires every entry whose deadline passed.
    fn due_timers(&self) -> Vec<TimerEntry> {
        let now = Instant::now();
        let mut timers = self.timers.lock().unwrap();
        let mut due = Vec::new();
        while let Some(entry) = timers.peek() {
            if entry.deadline > now {
                break;
            }
            due.push(timers.pop().unwrap());
        }
        due
    }

    fn binding(&self, token: Token) -> Option<Arc<dyn ReadySource>> {
        self.bindings.lock().unwrap().get(&token).cloned()
    }
}

/// The reactor thread body: poll, dispatch readiness, fire timers.
pub(crate) fn run(core: Arc<crate::service::ServiceCore>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    debug!("reactor loop entered");
    while !core.reactor.shutdown.load(MemOrdering::Acquire) {
        let timeout = core.reactor.next_timeout();
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("reactor poll failed: {}", e);
            core.report_error(streamwarp_core::error::Error::Transport(e));
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(binding) = core.reactor.binding(event.token()) {
                binding.on_ready(
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                );
            }
        }
        for entry in core.reactor.due_timers() {
            if let Some(timer) = entry.shared.upgrade() {
                timer.fire_from_reactor(entry.generation);
            }
        }
    }
    debug!("reactor loop exited");
}
