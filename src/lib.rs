//! Blocking client for UNIX-domain datagram control sockets.
//!
//! Many local daemons expose a control interface as a UNIX datagram socket:
//! the client binds its own private endpoint, `connect(2)`s to the daemon's
//! socket, and exchanges free-form command strings. The protocol carries no
//! request IDs — exactly one request may be outstanding at a time — and the
//! daemon may interleave unsolicited *event* datagrams (marked by a leading
//! `<priority>` header) with replies on the same descriptor.
//!
//! # Architecture
//!
//! ```text
//! caller ──request(cmd, timeout)──► Channel
//!                                     │ wait writable ─► Multiplexer (poll/select/epoll)
//!                                     │ send datagram ─► peer control socket
//!                                     │ wait readable ─► Multiplexer
//!                                     │ recv datagram
//!                                     │ classify ──► reply  ──► returned to caller
//!                                     │          └─► event  ──► EventDispatcher
//!                                     ▼
//!                              EventDispatcher ──drain()/sink──► caller
//! ```
//!
//! The local endpoint lives at a collision-resistant path under a runtime
//! directory and is unlinked when the channel closes. Every wait passes
//! through the readiness multiplexer with a concrete deadline; there is no
//! unbounded blocking call anywhere, and signal interruption of a wait is
//! retried transparently with the remaining budget.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ctrlgram::Channel;
//!
//! # fn main() -> ctrlgram::Result<()> {
//! let mut chan = Channel::open("/var/run/ctrl/daemon")?;
//! let reply = chan.request(b"PING", Duration::from_millis(200))?;
//! assert_eq!(reply, b"PONG");
//! for event in chan.drain_events() {
//!     println!("[{}] {}", event.priority(), String::from_utf8_lossy(event.message()));
//! }
//! chan.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! A [`Channel`] is single-owner: its methods take `&mut self`, so safe Rust
//! cannot interleave two requests on one channel. To share a channel across
//! threads, wrap it in [`SharedChannel`] and hold the lock for the duration
//! of each request — a second caller then blocks deterministically on the
//! mutex. [`Channel::request`] is not reentrant; the internal state guard
//! reports [`Error::ConcurrentRequest`] if a previous cycle was abandoned
//! without completing.

pub mod binder;
pub mod channel;
pub mod error;
pub mod events;
pub mod frame;
pub mod readiness;

#[cfg(test)]
mod integration_test;

pub use binder::{AddressBinder, Endpoint};
pub use channel::{Channel, ChannelOptions, SharedChannel};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventSink};
pub use frame::{EventFrame, Frame, EVENT_SENTINEL, MAX_FRAME_SIZE};
pub use readiness::{DefaultMultiplexer, Interest, Multiplexer, Readiness};
