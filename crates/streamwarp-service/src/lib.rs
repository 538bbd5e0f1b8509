#![warn(missing_docs)]

//! streamwarp-service: shared reactor and work scheduling.
//!
//! This crate owns the runtime every endpoint hangs off:
//! - [`Service`]: one reactor thread multiplexing socket readiness and
//!   timers, plus a pool of worker threads executing jobs
//! - [`Strand`]: a virtual single-threaded executor serializing the
//!   callbacks of one endpoint over the multi-threaded pool
//! - [`Timer`]: a one-shot, rescheduleable wakeup bound to a service
//! - [`ServiceHandler`]: the embedder's event sink for service lifecycle
//!
//! Higher layers register readiness sources through
//! [`Service::register_source`] and receive scheduling callbacks via
//! [`ReadySource`].

mod handler;
mod reactor;
mod service;
mod strand;
mod timer;

pub use handler::ServiceHandler;
pub use reactor::ReadySource;
pub use service::Service;
pub use strand::Strand;
pub use timer::Timer;

/// Readiness token re-exported for source registration.
pub use mio::Token;
/// Registration interest re-exported for source registration.
pub use mio::Interest;
