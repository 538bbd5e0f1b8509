//! Error types shared across all layers.
//!
//! A single [`Error`] enum carries every failure the stack can report
//! through `on_error` callbacks. [`Error::category`] maps each variant
//! into the coarse taxonomy embedders switch on: `transport`,
//! `protocol`, `resource`, `tls`, `cancelled` and `programmer`.

use std::io;

use thiserror::Error as ThisError;

/// Convenience result alias over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification reported alongside every error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket-level failure. Fatal to the affected session, non-fatal to its server.
    Transport,
    /// Malformed HTTP or WebSocket input, or a handshake mismatch.
    Protocol,
    /// A configured limit was exceeded; the offending operation is rejected.
    Resource,
    /// TLS handshake, certificate or record failure. Fatal to the session.
    Tls,
    /// Cooperative shutdown. Mapped to terminal transitions, never surfaced
    /// through `on_error`.
    Cancelled,
    /// Invalid argument or wrong-state operation by the embedder.
    Programmer,
}

impl ErrorCategory {
    /// Stable lowercase name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Tls => "tls",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Programmer => "programmer",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported through `on_error` callbacks and returned by fallible
/// operations across the stack.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Socket-level failure (refused, reset, timed out, ...).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Malformed HTTP message.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),
    /// An HTTP message exceeded `http_max_header_size` or `http_max_body_size`.
    #[error("HTTP limit exceeded: {0}")]
    HttpLimitExceeded(String),
    /// Malformed WebSocket frame.
    #[error("WebSocket protocol error: {0}")]
    WsProtocol(String),
    /// The WebSocket upgrade handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    WsHandshake(String),
    /// The peer did not answer a close frame within `ws_close_timeout`.
    #[error("WebSocket close handshake timed out")]
    WsCloseTimeout,
    /// The send region would exceed `send_buffer_limit`.
    #[error("send buffer overflow: {pending} pending bytes exceed limit of {limit}")]
    BufferOverflow {
        /// Bytes already pending in the send region.
        pending: usize,
        /// Configured limit that would be exceeded.
        limit: usize,
    },
    /// An inbound message exceeded a configured size limit.
    #[error("message too large: {size} bytes exceed limit of {limit}")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit that was exceeded.
        limit: usize,
    },
    /// TLS engine failure.
    #[error("TLS error: {0}")]
    Tls(String),
    /// Cooperative shutdown of a pending operation.
    #[error("operation aborted")]
    Cancelled,
    /// Operation attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Invalid argument supplied by the embedder.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Classifies this error into the coarse reporting taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_) => ErrorCategory::Transport,
            Error::HttpProtocol(_) | Error::WsProtocol(_) | Error::WsHandshake(_) => {
                ErrorCategory::Protocol
            }
            Error::WsCloseTimeout => ErrorCategory::Protocol,
            Error::HttpLimitExceeded(_)
            | Error::BufferOverflow { .. }
            | Error::MessageTooLarge { .. } => ErrorCategory::Resource,
            Error::Tls(_) => ErrorCategory::Tls,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::InvalidState(_) | Error::InvalidArgument(_) => ErrorCategory::Programmer,
        }
    }

    /// Whether this error terminates the session it was reported on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Protocol | ErrorCategory::Tls
        )
    }

    /// Whether this error stems from cooperative cancellation.
    ///
    /// Cancellation must never reach `on_error`; callers use this to map
    /// it to the appropriate terminal transition instead.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
            || matches!(self, Error::Transport(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_match_taxonomy() {
        let io_err = Error::Transport(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(io_err.category(), ErrorCategory::Transport);
        assert!(io_err.is_fatal());

        let overflow = Error::BufferOverflow { pending: 10, limit: 5 };
        assert_eq!(overflow.category(), ErrorCategory::Resource);
        assert!(!overflow.is_fatal());

        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
        assert!(Error::Cancelled.is_cancelled());

        assert_eq!(
            Error::InvalidState("send before connect").category(),
            ErrorCategory::Programmer
        );
    }

    #[test]
    fn display_carries_context() {
        let err = Error::MessageTooLarge { size: 100, limit: 10 };
        assert_eq!(err.to_string(), "message too large: 100 bytes exceed limit of 10");
        assert_eq!(err.category().to_string(), "resource");
    }
}
