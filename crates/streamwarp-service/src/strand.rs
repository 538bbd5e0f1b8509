//! Per-endpoint serializing executor.

use std::{
    cell::Cell,
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::service::{Job, Service};

thread_local! {
    static CURRENT_STRAND: Cell<usize> = const { Cell::new(0) };
}

/// A virtual single-threaded executor over a multi-threaded service.
///
/// Jobs posted through the same strand run one at a time, in post
/// order, with a happens-before edge between consecutive jobs. The
/// implementation is a mailbox: jobs queue under a lock and a single
/// runner drains the queue on a worker; at most one runner is
/// scheduled at any time.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    service: Service,
    state: Mutex<MailboxState>,
}

struct MailboxState {
    queue: VecDeque<Job>,
    scheduled: bool,
}

impl Strand {
    pub(crate) fn new(service: Service) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                service,
                state: Mutex::new(MailboxState { queue: VecDeque::new(), scheduled: false }),
            }),
        }
    }

    /// The service this strand schedules onto.
    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// Enqueues a job, scheduling a runner if none is active.
    ///
    /// Returns `false` when the service is not accepting work; the job
    /// is dropped in that case.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let schedule = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(Box::new(job));
            if state.scheduled {
                false
            } else {
                state.scheduled = true;
                true
            }
        };
        if schedule {
            let inner = self.inner.clone();
            if !self.inner.service.post(move || StrandInner::run(inner)) {
                let mut state = self.inner.state.lock().unwrap();
                state.queue.clear();
                state.scheduled = false;
                return false;
            }
        }
        true
    }

    /// Runs the job inline when the caller is already executing on this
    /// strand, otherwise posts it.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.is_running_in_this_thread() {
            job();
            true
        } else {
            self.post(job)
        }
    }

    /// Whether the calling thread is currently draining this strand.
    pub fn is_running_in_this_thread(&self) -> bool {
        let id = Arc::as_ptr(&self.inner) as usize;
        CURRENT_STRAND.with(|current| current.get() == id)
    }
}

impl StrandInner {
    /// Drains the mailbox to empty, then clears the scheduled flag.
    /// Jobs posted while draining are picked up by the same runner,
    /// which is what keeps per-strand FIFO order without rescheduling.
    fn run(inner: Arc<StrandInner>) {
        let id = Arc::as_ptr(&inner) as usize;
        CURRENT_STRAND.with(|current| current.set(id));
        loop {
            let job = {
                let mut state = inner.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.scheduled = false;
                        break;
                    }
                }
            };
            job();
        }
        CURRENT_STRAND.with(|current| current.set(0));
    }
}
