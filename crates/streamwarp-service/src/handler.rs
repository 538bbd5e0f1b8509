//! Service lifecycle event sink.

use streamwarp_core::error::Error;

/// Event sink for service lifecycle notifications.
///
/// Implementations are shared across worker threads, so methods take
/// `&self`; embedders keep mutable state in atomics or locks.
/// Every method has a no-op default.
pub trait ServiceHandler: Send + Sync {
    /// A worker thread entered its loop.
    fn on_thread_initialize(&self) {}
    /// A worker thread is about to exit.
    fn on_thread_cleanup(&self) {}
    /// The service started; workers and the reactor are running.
    fn on_started(&self) {}
    /// The service stopped; all callbacks have drained.
    fn on_stopped(&self) {}
    /// A polling-mode worker found no pending work.
    fn on_idle(&self) {}
    /// The reactor or a worker hit an error it cannot attribute to an
    /// endpoint.
    fn on_error(&self, error: &Error) {}
}

/// No-op sink for embedders that only care about endpoint events.
impl ServiceHandler for () {}
