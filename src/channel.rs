//! The control channel: request/reply plus asynchronous events on one
//! UNIX-datagram descriptor.
//!
//! # Lifecycle
//!
//! ```text
//! Channel::open(peer)
//!   │  AddressBinder::bind()   → Bound   (transient, inside open)
//!   │  connect(peer path)      → Connected
//!   ▼
//! request(cmd, timeout)        → AwaitingReply ─► Connected
//! receive(timeout)             one datagram, classified
//! close() / Drop               → Closed  (fd closed, local path unlinked)
//! ```
//!
//! The wire protocol has no request IDs: replies correlate with requests
//! only by the one-outstanding-request discipline. Methods take `&mut self`,
//! so safe Rust cannot interleave two requests on one channel; sharing
//! across threads goes through [`SharedChannel`], where the second caller
//! blocks on the mutex for the (deadline-bounded) duration of the first
//! request. The [`crate::Error::ConcurrentRequest`] guard additionally
//! catches a cycle abandoned by a panic.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::binder::{self, AddressBinder, Endpoint, DEFAULT_BIND_ATTEMPTS};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventSink};
use crate::frame::{self, EventFrame, Frame, MAX_FRAME_SIZE};
use crate::readiness::{DefaultMultiplexer, Interest, Multiplexer, Readiness};

/// A channel shared across threads. Lock for the duration of each call;
/// every wait inside is deadline-bounded, so the lock is never held
/// indefinitely.
pub type SharedChannel = Arc<Mutex<Channel>>;

/// `send(2)` flags for request datagrams.
///
/// `MSG_NOSIGNAL` keeps a vanished peer from raising `SIGPIPE`; the error
/// still arrives as `EPIPE` through the normal return path.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// `recv(2)` flags for control datagrams.
///
/// `MSG_TRUNC` makes the kernel report the true datagram length even when
/// it exceeds the buffer, so an over-limit frame is detected as malformed
/// instead of being silently truncated to a plausible-looking prefix.
#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_TRUNC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Connected,
    AwaitingReply,
    Closed,
}

/// Tunables for [`Channel::open_with`].
pub struct ChannelOptions {
    /// Directory for the local endpoint socket node.
    pub runtime_dir: PathBuf,
    /// Bind retries before `BindExhausted`.
    pub max_bind_attempts: u32,
    /// Readiness backend; `None` uses the build-selected
    /// [`DefaultMultiplexer`].
    pub multiplexer: Option<Box<dyn Multiplexer>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir(),
            max_bind_attempts: DEFAULT_BIND_ATTEMPTS,
            multiplexer: None,
        }
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("runtime_dir", &self.runtime_dir)
            .field("max_bind_attempts", &self.max_bind_attempts)
            .field("multiplexer", &self.multiplexer.as_ref().map(|_| "injected"))
            .finish()
    }
}

/// Client endpoint of a UNIX-datagram control socket.
///
/// Owns the bound descriptor and its filesystem path exclusively; both are
/// released on [`Channel::close`] or drop.
pub struct Channel {
    endpoint: Option<Endpoint>,
    peer: PathBuf,
    state: ChannelState,
    mux: Box<dyn Multiplexer>,
    events: EventDispatcher,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.endpoint.as_ref().map(Endpoint::path))
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("events", &self.events)
            .finish()
    }
}

impl Channel {
    /// Open a channel to the control socket at `peer` with default options.
    ///
    /// # Errors
    ///
    /// [`Error::BindExhausted`] if no local endpoint could be acquired,
    /// [`Error::ConnectFailed`] if the peer path is missing or refuses, and
    /// [`Error::System`] for any other OS failure.
    pub fn open(peer: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(peer, ChannelOptions::default())
    }

    /// Open a channel with explicit options.
    pub fn open_with(peer: impl AsRef<Path>, options: ChannelOptions) -> Result<Self> {
        let peer = peer.as_ref().to_path_buf();
        let binder = AddressBinder::new(&options.runtime_dir)
            .with_max_attempts(options.max_bind_attempts);
        let endpoint = binder.bind()?;

        let (addr, addr_len) = binder::sockaddr_un(&peer)?;
        // SAFETY: `addr` is a fully initialized sockaddr_un and `addr_len`
        // covers exactly its populated prefix.
        let rc = unsafe {
            libc::connect(
                endpoint.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Endpoint drop unlinks the half-opened local node.
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ECONNREFUSED) => Error::ConnectFailed {
                    path: peer,
                    source: err,
                },
                _ => Error::System(err),
            });
        }

        let mux: Box<dyn Multiplexer> = match options.multiplexer {
            Some(mux) => mux,
            None => Box::new(DefaultMultiplexer::new()?),
        };

        log::debug!(
            "[channel] {} connected to {}",
            endpoint.path().display(),
            peer.display()
        );
        Ok(Self {
            endpoint: Some(endpoint),
            peer,
            state: ChannelState::Connected,
            mux,
            events: EventDispatcher::new(),
        })
    }

    /// Send one command datagram and await its reply, bounded by `timeout`.
    ///
    /// Event datagrams arriving while the reply is pending are routed to the
    /// event dispatcher (sink if attached, else the drain queue) and do not
    /// consume a reply slot; the overall deadline still applies to them.
    ///
    /// Not reentrant. The one-outstanding-request rule is a property of the
    /// wire protocol, not of this implementation — callers sharing a channel
    /// must serialize externally (see [`SharedChannel`]).
    ///
    /// # Errors
    ///
    /// [`Error::ConcurrentRequest`] if a previous cycle is still pending,
    /// [`Error::RequestTimeout`] once `timeout` elapses with no reply,
    /// [`Error::MalformedFrame`] for an unclassifiable datagram, and
    /// [`Error::Closed`] if the channel is (or becomes) closed.
    pub fn request(&mut self, cmd: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        match self.state {
            ChannelState::Closed => return Err(Error::Closed),
            ChannelState::AwaitingReply => return Err(Error::ConcurrentRequest),
            ChannelState::Connected => {}
        }

        self.state = ChannelState::AwaitingReply;
        let result = self.request_cycle(cmd, timeout);
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Connected;
        }
        if matches!(result, Err(Error::Closed)) {
            // The descriptor went bad under us; release what remains.
            self.close();
        }
        result
    }

    /// One request/reply cycle: send, then classify datagrams until the
    /// reply arrives or the deadline passes.
    fn request_cycle(&mut self, cmd: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now().checked_add(timeout);
        self.send_request(cmd, timeout, deadline)?;

        loop {
            let remaining = remaining_budget(deadline, timeout)
                .ok_or(Error::RequestTimeout { timeout })?;
            match self
                .mux
                .wait(self.fd()?, Interest::Readable, remaining)
                .map_err(Error::from_os)?
            {
                Readiness::TimedOut => return Err(Error::RequestTimeout { timeout }),
                Readiness::Ready => {}
            }
            let Some(datagram) = self.recv_datagram()? else {
                // Spurious readiness; re-wait with the remaining budget.
                continue;
            };
            match frame::classify(&datagram)? {
                Frame::Reply(bytes) => return Ok(bytes),
                Frame::Event(event) => {
                    log::debug!(
                        "[channel] event during request (priority {})",
                        event.priority()
                    );
                    self.events.dispatch(event);
                }
            }
        }
    }

    /// Wait for writability and send `cmd` as a single datagram.
    fn send_request(
        &mut self,
        cmd: &[u8],
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            let remaining = remaining_budget(deadline, timeout)
                .ok_or(Error::RequestTimeout { timeout })?;
            match self
                .mux
                .wait(self.fd()?, Interest::Writable, remaining)
                .map_err(Error::from_os)?
            {
                Readiness::TimedOut => return Err(Error::RequestTimeout { timeout }),
                Readiness::Ready => {}
            }

            // SAFETY: `cmd` is valid for `cmd.len()` bytes for the duration
            // of the call.
            let n = unsafe {
                libc::send(
                    self.fd()?,
                    cmd.as_ptr().cast::<libc::c_void>(),
                    cmd.len(),
                    SEND_FLAGS,
                )
            };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    // Writability evaporated between wait and send.
                    continue;
                }
                Some(libc::EISCONN) => {
                    // Some platforms report EISCONN from send() on a
                    // connected datagram socket even though the datagram was
                    // queued. Policy: suppress — the message is on its way,
                    // and the reply wait will catch a genuinely dead peer.
                    log::debug!("[channel] suppressing benign EISCONN from send");
                    return Ok(());
                }
                _ => return Err(Error::from_os(err)),
            }
        }
    }

    /// Receive one whole datagram, or `None` if the socket had nothing
    /// after all (spurious readiness).
    fn recv_datagram(&mut self) -> Result<Option<Vec<u8>>> {
        let fd = self.fd()?;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        // SAFETY: `buf` is valid for MAX_FRAME_SIZE writable bytes.
        let n = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                RECV_FLAGS,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => Ok(None),
                _ => Err(Error::from_os(err)),
            };
        }
        // With MSG_TRUNC the kernel reports the real datagram length; more
        // than fits the buffer means the excess bytes are already gone.
        let n = n as usize;
        if n > buf.len() {
            return Err(Error::MalformedFrame {
                reason: format!(
                    "datagram of {n} bytes exceeds the {MAX_FRAME_SIZE}-byte frame maximum"
                ),
            });
        }
        // Datagram semantics: whole messages or none, no partial reads. An
        // empty datagram is below the minimum valid frame and classify()
        // reports it as malformed.
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Read and classify the next available frame, outside a request cycle.
    ///
    /// One datagram per call, using the same classification as the reply
    /// loop in [`Channel::request`]:
    ///
    /// - a reply datagram is returned as `Some(Frame::Reply(..))` — with no
    ///   request pending it is stale, and the caller decides what to do;
    /// - an event is delivered to the attached sink (returning `Ok(None)`),
    ///   or returned as `Some(Frame::Event(..))` when no sink is attached —
    ///   the caller of `receive` is then the consumer, so the frame does not
    ///   also land in the drain queue;
    /// - `Ok(None)` if nothing arrived within `timeout`.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        if self.state == ChannelState::Closed {
            return Err(Error::Closed);
        }
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = timeout;
        loop {
            match self
                .mux
                .wait(self.fd()?, Interest::Readable, remaining)
                .map_err(Error::from_os)?
            {
                Readiness::TimedOut => return Ok(None),
                Readiness::Ready => {}
            }
            if let Some(datagram) = self.recv_datagram()? {
                return match frame::classify(&datagram)? {
                    reply @ Frame::Reply(_) => Ok(Some(reply)),
                    Frame::Event(event) => {
                        if self.events.sink_attached() {
                            self.events.dispatch(event);
                            Ok(None)
                        } else {
                            Ok(Some(Frame::Event(event)))
                        }
                    }
                };
            }
            remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    /// Probe whether a datagram is ready to read within `timeout`.
    pub fn pending(&mut self, timeout: Duration) -> Result<bool> {
        if self.state == ChannelState::Closed {
            return Err(Error::Closed);
        }
        match self
            .mux
            .wait(self.fd()?, Interest::Readable, timeout)
            .map_err(Error::from_os)?
        {
            Readiness::Ready => Ok(true),
            Readiness::TimedOut => Ok(false),
        }
    }

    /// Attach an event sink. Queued events are flushed into it in arrival
    /// order; subsequent events are delivered directly.
    pub fn attach_event_listener<S: EventSink + 'static>(&mut self, sink: S) {
        self.events.attach(Box::new(sink));
    }

    /// Remove and return all queued event frames, oldest first.
    pub fn drain_events(&mut self) -> Vec<EventFrame> {
        self.events.drain()
    }

    /// Number of queued (undrained) event frames.
    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    /// Path of the local endpoint, or `None` once closed.
    pub fn local_path(&self) -> Option<&Path> {
        self.endpoint.as_ref().map(Endpoint::path)
    }

    /// Path of the peer control socket.
    pub fn peer_path(&self) -> &Path {
        &self.peer
    }

    /// True once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Close the channel: release the descriptor and unlink the local path.
    ///
    /// Idempotent. Unlink failure is logged, not fatal. Queued events remain
    /// drainable after close.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed && self.endpoint.is_none() {
            return;
        }
        self.state = ChannelState::Closed;
        if let Some(endpoint) = self.endpoint.take() {
            log::debug!("[channel] closing {}", endpoint.path().display());
            drop(endpoint);
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.endpoint
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::Closed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Budget left before `deadline`, or `None` once it has passed.
///
/// A `None` deadline means the requested timeout overflowed `Instant`
/// arithmetic; treat the budget as the full timeout every iteration.
fn remaining_budget(deadline: Option<Instant>, full: Duration) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                None
            } else {
                Some(remaining)
            }
        }
        None => Some(full),
    }
}
