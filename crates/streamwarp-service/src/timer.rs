//! One-shot, rescheduleable timers bound to a service.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::service::Service;

/// Callback invoked when a timer fires or is cancelled.
///
/// The flag is `true` when the wait was cancelled (explicitly or by
/// service shutdown) and `false` on normal expiration.
pub type TimerAction = Box<dyn FnMut(bool) + Send>;

struct ArmState {
    /// Bumped on every cancel/reschedule; queued deadlines carry the
    /// generation they were armed under and fire only on a match.
    generation: u64,
    armed: bool,
    deadline: Instant,
}

pub(crate) struct TimerShared {
    service: Service,
    state: Mutex<ArmState>,
    action: Mutex<Option<TimerAction>>,
    expired: Condvar,
}

/// A one-shot asynchronous wakeup.
///
/// A timer holds a deadline (absolute or relative) and an optional
/// action. `wait_async` arms a single outstanding wait; expiration
/// invokes the action with `cancelled = false` on a worker thread,
/// while `cancel`, rescheduling and service shutdown invoke it with
/// `cancelled = true`. Cancellation is never reported as an error.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Creates an unarmed timer with no action, expiring now.
    pub fn new(service: Service) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                service,
                state: Mutex::new(ArmState {
                    generation: 0,
                    armed: false,
                    deadline: Instant::now(),
                }),
                action: Mutex::new(None),
                expired: Condvar::new(),
            }),
        }
    }

    /// Creates a timer with an action.
    pub fn with_action(service: Service, action: impl FnMut(bool) + Send + 'static) -> Self {
        let timer = Self::new(service);
        timer.setup_action(action);
        timer
    }

    /// Replaces the action invoked on expiration or cancellation.
    pub fn setup_action(&self, action: impl FnMut(bool) + Send + 'static) {
        *self.shared.action.lock().unwrap() = Some(Box::new(action));
    }

    /// Sets an absolute deadline. A pending wait is superseded: its
    /// action fires with `cancelled = true`.
    pub fn setup_at(&self, deadline: Instant) -> bool {
        let superseded = {
            let mut state = self.shared.state.lock().unwrap();
            state.generation += 1;
            state.deadline = deadline;
            std::mem::replace(&mut state.armed, false)
        };
        self.shared.expired.notify_all();
        if superseded {
            self.shared.post_action(true);
        }
        true
    }

    /// Sets a deadline relative to now. A pending wait is superseded.
    pub fn setup_after(&self, span: Duration) -> bool {
        self.setup_at(Instant::now() + span)
    }

    /// Current absolute deadline.
    pub fn expire_time(&self) -> Instant {
        self.shared.state.lock().unwrap().deadline
    }

    /// Nanoseconds until the deadline; negative once it has passed.
    pub fn expire_timespan(&self) -> i128 {
        let deadline = self.expire_time();
        let now = Instant::now();
        if deadline >= now {
            (deadline - now).as_nanos() as i128
        } else {
            -((now - deadline).as_nanos() as i128)
        }
    }

    /// Arms a one-shot asynchronous wait on the current deadline.
    ///
    /// Fails when a wait is already outstanding or the service is not
    /// running.
    pub fn wait_async(&self) -> bool {
        let (generation, deadline) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.armed {
                return false;
            }
            state.armed = true;
            (state.generation, state.deadline)
        };
        let queued = self.shared.service.core.reactor.schedule_timer(
            deadline,
            generation,
            Arc::downgrade(&self.shared),
        );
        if !queued {
            self.shared.state.lock().unwrap().armed = false;
        }
        queued
    }

    /// Blocks the calling thread until the deadline passes or the
    /// timer is cancelled/rescheduled. Returns `true` on normal
    /// expiration. Illegal on worker threads (it would park a thread
    /// the pool needs) and fails there.
    pub fn wait_sync(&self) -> bool {
        if Service::is_worker_thread() {
            return false;
        }
        let mut state = self.shared.state.lock().unwrap();
        let generation = state.generation;
        loop {
            if state.generation != generation {
                return false;
            }
            let now = Instant::now();
            if now >= state.deadline {
                return true;
            }
            let span = state.deadline - now;
            let (next, _) = self.shared.expired.wait_timeout(state, span).unwrap();
            state = next;
        }
    }

    /// Cancels a pending wait; its action fires with `cancelled = true`.
    /// Returns `true` when a wait was actually pending.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.shared.state.lock().unwrap();
            state.generation += 1;
            std::mem::replace(&mut state.armed, false)
        };
        self.shared.expired.notify_all();
        if cancelled {
            self.shared.post_action(true);
        }
        cancelled
    }
}

impl TimerShared {
    /// Invoked by the reactor when a queued deadline comes due.
    pub(crate) fn fire_from_reactor(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.armed || state.generation != generation {
                return;
            }
            state.armed = false;
        }
        self.expired.notify_all();
        self.post_action(false);
    }

    /// Invoked during service shutdown for queued waits.
    pub(crate) fn abort_from_service(self: &Arc<Self>) {
        let aborted = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            std::mem::replace(&mut state.armed, false)
        };
        self.expired.notify_all();
        if aborted {
            self.post_action(true);
        }
    }

    /// Schedules the action on the pool; runs it inline if the pool is
    /// no longer accepting work so a cancellation is never lost.
    fn post_action(self: &Arc<Self>, cancelled: bool) {
        let shared = self.clone();
        let job = move || {
            let mut action = shared.action.lock().unwrap();
            if let Some(action) = action.as_mut() {
                action(cancelled);
            }
        };
        if !self.service.core.post(Box::new(job)) {
            let mut action = self.action.lock().unwrap();
            if let Some(action) = action.as_mut() {
                action(cancelled);
            }
        }
    }
}
