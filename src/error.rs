//! Error taxonomy for the control-socket client.
//!
//! Transient `EINTR` interruption of a readiness wait is retried inside the
//! multiplexer and never surfaces here. Timeouts and malformed frames are
//! reported, not retried — retry policy belongs to the caller.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by channel, binder, and frame operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not acquire a local endpoint after the bounded retry budget.
    ///
    /// Fatal to `open`. Every attempt failed with an address collision.
    #[error("could not bind a local control endpoint after {attempts} attempt(s)")]
    BindExhausted {
        /// Number of bind attempts made before giving up.
        attempts: u32,
    },

    /// The peer control socket is missing or refused the connection.
    ///
    /// Fatal to `open`. Permission problems and other OS errors are reported
    /// as [`Error::System`] instead.
    #[error("failed to connect to control socket {path}: {source}")]
    ConnectFailed {
        /// The peer path that was being connected to.
        path: PathBuf,
        /// The underlying connect error.
        source: io::Error,
    },

    /// No reply datagram arrived within the deadline.
    ///
    /// Recoverable: the channel returns to the connected state and the
    /// caller may retry. Note that the peer's reply may still arrive later
    /// and would then be classified against the *next* request — a quirk
    /// inherent to the ID-less wire protocol.
    #[error("no reply within {timeout:?}")]
    RequestTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A received datagram was below the minimum valid size or carried an
    /// unparsable event header.
    ///
    /// Surfaced to the caller, never silently dropped.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Human-readable description of what failed to parse.
        reason: String,
    },

    /// Operation attempted on, or interrupted by, a closed channel.
    ///
    /// Any syscall failing with `EBADF` maps here, so a descriptor closed
    /// out from under a pending wait fails promptly rather than hanging.
    #[error("channel is closed")]
    Closed,

    /// `request` was entered while a previous request cycle was still
    /// awaiting its reply.
    ///
    /// The wire protocol has no request IDs, so interleaved requests would
    /// corrupt reply classification. This is a programming error and is
    /// surfaced immediately, before anything touches the wire.
    #[error("a request is already awaiting its reply on this channel")]
    ConcurrentRequest,

    /// Any other OS-level failure, carrying the underlying error code.
    #[error("system error: {0}")]
    System(#[from] io::Error),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map an I/O error to the channel taxonomy.
    ///
    /// `EBADF` means the descriptor was closed out from under the operation,
    /// which callers observe as [`Error::Closed`].
    pub(crate) fn from_os(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::EBADF) {
            Error::Closed
        } else {
            Error::System(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebadf_maps_to_closed() {
        let err = Error::from_os(io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn other_errno_maps_to_system() {
        let err = Error::from_os(io::Error::from_raw_os_error(libc::EACCES));
        match err {
            Error::System(io) => assert_eq!(io.raw_os_error(), Some(libc::EACCES)),
            other => panic!("expected System, got {other:?}"),
        }
    }
}
