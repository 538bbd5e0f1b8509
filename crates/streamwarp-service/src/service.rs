//! The service: reactor ownership, worker pool and work dispatch.

use std::{
    cell::Cell,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use mio::{event::Source, Interest, Poll, Token, Waker};
use tracing::{debug, error};

use streamwarp_core::{config::Config, error::Error};

use crate::{
    handler::ServiceHandler,
    reactor::{self, ReactorShared, ReadySource, WAKER_TOKEN},
    strand::Strand,
};

/// A unit of work executed on a worker thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// How long a parked worker sleeps before re-checking the running flag.
const PARK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Owner of the reactor and the worker pool.
///
/// A `Service` multiplexes socket readiness and timer expirations
/// across one reactor thread and `worker_count` worker threads. Every
/// endpoint (session, server, timer) is bound to exactly one service
/// and schedules its callbacks through it. Handles are cheap clones
/// over a shared core.
#[derive(Clone)]
pub struct Service {
    pub(crate) core: Arc<ServiceCore>,
}

pub(crate) struct ServiceCore {
    config: Config,
    handler: Arc<dyn ServiceHandler>,
    state: Mutex<Lifecycle>,
    /// Workers accept jobs while this holds. Cleared only after the
    /// in-flight count drains to zero during `stop`.
    running: AtomicBool,
    polling: AtomicBool,
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    /// Jobs queued or executing. `stop` waits for zero before parking
    /// the pool, which is what makes "no callback after stop" hold.
    in_flight: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    pub(crate) reactor: ReactorShared,
}

impl Service {
    /// Creates a stopped service with the given configuration and
    /// lifecycle event sink.
    pub fn new(config: Config, handler: Arc<dyn ServiceHandler>) -> Self {
        let (job_tx, job_rx) = unbounded();
        Self {
            core: Arc::new(ServiceCore {
                config,
                handler,
                state: Mutex::new(Lifecycle::Stopped),
                running: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                job_tx,
                job_rx,
                in_flight: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
                reactor: ReactorShared::new(),
            }),
        }
    }

    /// The configuration this service was built with.
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Whether the service is currently running.
    pub fn is_started(&self) -> bool {
        *self.core.state.lock().unwrap() == Lifecycle::Running
    }

    /// Whether the current run uses polling workers.
    pub fn is_polling(&self) -> bool {
        self.core.polling.load(Ordering::Relaxed)
    }

    /// Whether the calling thread is one of this process' worker
    /// threads (of any service).
    pub fn is_worker_thread() -> bool {
        IS_WORKER.with(|w| w.get())
    }

    /// Launches the reactor and the worker pool in the configured
    /// polling mode. Fails if the service is not stopped.
    pub fn start(&self) -> bool {
        self.start_with_polling(self.core.config.polling)
    }

    /// Launches the reactor and the worker pool.
    ///
    /// In polling mode idle workers spin on the job queue and report
    /// `on_idle`; otherwise they park between jobs.
    pub fn start_with_polling(&self, polling: bool) -> bool {
        {
            let mut state = self.core.state.lock().unwrap();
            if *state != Lifecycle::Stopped {
                return false;
            }
            *state = Lifecycle::Starting;
        }

        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                self.fail_start(Error::Transport(e));
                return false;
            }
        };
        let registry = match poll.registry().try_clone() {
            Ok(r) => r,
            Err(e) => {
                self.fail_start(Error::Transport(e));
                return false;
            }
        };
        let waker = match Waker::new(poll.registry(), WAKER_TOKEN) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail_start(Error::Transport(e));
                return false;
            }
        };

        self.core.reactor.install(registry, waker);
        self.core.polling.store(polling, Ordering::Relaxed);
        self.core.running.store(true, Ordering::Release);

        let mut threads = self.core.threads.lock().unwrap();
        let reactor_core = self.core.clone();
        threads.push(
            thread::Builder::new()
                .name("streamwarp-reactor".into())
                .spawn(move || reactor::run(reactor_core, poll))
                .expect("failed to spawn reactor thread"),
        );
        let workers = self.core.config.effective_worker_count();
        for index in 0..workers {
            let worker_core = self.core.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("streamwarp-worker-{}", index))
                    .spawn(move || worker_loop(worker_core, polling))
                    .expect("failed to spawn worker thread"),
            );
        }
        drop(threads);

        *self.core.state.lock().unwrap() = Lifecycle::Running;
        debug!(workers, polling, "service started");
        self.core.handler.on_started();
        true
    }

    /// Requests shutdown, drains in-flight handlers and joins every
    /// thread. No event callback runs after this returns.
    ///
    /// Must not be called from a worker thread (a callback cannot wait
    /// for itself to finish); such calls fail and report a programmer
    /// error.
    pub fn stop(&self) -> bool {
        if Service::is_worker_thread() {
            self.core.report_error(Error::InvalidState("stop called from a worker thread"));
            return false;
        }
        {
            let mut state = self.core.state.lock().unwrap();
            if *state != Lifecycle::Running {
                return false;
            }
            *state = Lifecycle::Stopping;
        }

        // Abort every registered endpoint and queued timer. Aborts map
        // to terminal transitions (disconnects, cancelled waits); they
        // are scheduled like ordinary jobs and drained below.
        for binding in self.core.reactor.drain_bindings() {
            binding.on_abort();
        }
        for entry in self.core.reactor.drain_timers() {
            if let Some(timer) = entry.shared.upgrade() {
                timer.abort_from_service();
            }
        }

        while self.core.in_flight.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_micros(500));
        }

        self.core.reactor.shutdown.store(true, Ordering::Release);
        self.core.reactor.wake();
        self.core.running.store(false, Ordering::Release);

        let threads: Vec<_> = self.core.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("service thread panicked during shutdown");
            }
        }
        self.core.reactor.teardown();

        *self.core.state.lock().unwrap() = Lifecycle::Stopped;
        debug!("service stopped");
        self.core.handler.on_stopped();
        true
    }

    /// Atomic stop + start preserving configuration and polling mode.
    pub fn restart(&self) -> bool {
        let polling = self.is_polling();
        if !self.stop() {
            return false;
        }
        self.start_with_polling(polling)
    }

    /// Enqueues a unit of work on the pool. Returns `false` when the
    /// service is not accepting work.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.core.post(Box::new(job))
    }

    /// Runs the work inline when the caller is already a worker thread,
    /// otherwise enqueues it.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if Service::is_worker_thread() {
            job();
            true
        } else {
            self.post(job)
        }
    }

    /// Creates a new serialization domain over this service.
    pub fn strand(&self) -> Strand {
        Strand::new(self.clone())
    }

    /// Registers a readiness source with the reactor.
    ///
    /// The returned token identifies the registration; the `ready`
    /// binding is held by the reactor until deregistration, keeping the
    /// endpoint alive while operations are outstanding.
    pub fn register_source<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interests: Interest,
        ready: Arc<dyn ReadySource>,
    ) -> io::Result<Token> {
        self.core.reactor.register(source, interests, ready)
    }

    /// Removes a readiness registration.
    pub fn deregister_source<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> bool {
        self.core.reactor.deregister(source, token)
    }

    fn fail_start(&self, error: Error) {
        self.core.report_error(error);
        *self.core.state.lock().unwrap() = Lifecycle::Stopped;
    }
}

impl ServiceCore {
    pub(crate) fn post(&self, job: Job) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.job_tx.send(job).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Reports an error through the sink on a worker when the pool is
    /// running, inline otherwise (e.g. a failed start).
    pub(crate) fn report_error(self: &Arc<Self>, error: Error) {
        if error.is_cancelled() {
            return;
        }
        if self.running.load(Ordering::Acquire) {
            let core = self.clone();
            self.post(Box::new(move || core.handler.on_error(&error)));
        } else {
            self.handler.on_error(&error);
        }
    }
}

fn worker_loop(core: Arc<ServiceCore>, polling: bool) {
    IS_WORKER.with(|w| w.set(true));
    core.handler.on_thread_initialize();
    if polling {
        loop {
            match core.job_rx.try_recv() {
                Ok(job) => {
                    job();
                    core.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                Err(TryRecvError::Empty) => {
                    if !core.running.load(Ordering::Acquire) {
                        break;
                    }
                    core.handler.on_idle();
                    thread::yield_now();
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
    } else {
        loop {
            match core.job_rx.recv_timeout(PARK_INTERVAL) {
                Ok(job) => {
                    job();
                    core.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !core.running.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    core.handler.on_thread_cleanup();
    IS_WORKER.with(|w| w.set(false));
}
