//! Descriptor-readiness waits with deadline and interruption handling.
//!
//! The control channel monitors exactly one descriptor, so the multiplexer
//! contract is deliberately narrow: "is this descriptor readable/writable
//! within timeout T?". Three interchangeable backends answer it — `poll(2)`,
//! `select(2)`, and `epoll(7)` on Linux — behind one trait, so the channel
//! never branches on the underlying primitive.
//!
//! The backend used by [`crate::Channel::open`] is chosen at build time via
//! the `poll`/`select`/`epoll` cargo features (see [`DefaultMultiplexer`]);
//! every backend the target supports is always compiled and can be injected
//! through [`crate::ChannelOptions`].
//!
//! # Interruption
//!
//! A signal landing mid-wait makes the syscall fail with `EINTR`. That is
//! neither an error nor a timeout: the provided [`Multiplexer::wait`] method
//! re-arms the wait with the *remaining* budget, recomputed against a
//! monotonic deadline, so interruption is invisible to callers and never
//! shortens or extends the timeout.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

/// What the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// A received datagram is available (or an error condition is pending).
    Readable,
    /// The socket can accept a datagram for sending.
    Writable,
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The descriptor is ready for the requested interest. Error conditions
    /// (`POLLERR`/`POLLHUP`) also report ready so the following `recv` or
    /// `send` surfaces the concrete errno.
    Ready,
    /// The timeout elapsed with the descriptor not ready.
    TimedOut,
}

/// Strategy interface over the platform readiness primitives.
///
/// Implementors provide a single raw wait; the trait supplies the
/// deadline/interruption loop on top so all backends behave identically.
pub trait Multiplexer: Send {
    /// One raw wait on `fd`, bounded by `timeout`.
    ///
    /// May fail with `ErrorKind::Interrupted`; callers should use
    /// [`Multiplexer::wait`], which retries that case transparently.
    fn wait_once(&self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness>;

    /// Wait for readiness, bounded by `timeout`, retrying transparently on
    /// signal interruption with the remaining budget.
    fn wait(&self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = timeout;
        loop {
            match self.wait_once(fd, interest, remaining) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    remaining = match deadline {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        // Deadline beyond Instant range: keep the full budget.
                        None => timeout,
                    };
                }
                other => return other,
            }
        }
    }
}

/// Convert a remaining budget to whole milliseconds for `poll`/`epoll`,
/// rounding up so a sub-millisecond remainder does not busy-spin.
fn timeout_millis(timeout: Duration) -> libc::c_int {
    let millis = timeout
        .as_millis()
        .saturating_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0));
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}

// ─── poll(2) ───────────────────────────────────────────────────────────────

/// `poll(2)`-backed multiplexer. Stateless; the portable default.
#[derive(Debug, Default, Clone, Copy)]
pub struct Poll;

impl Poll {
    /// Create a `poll(2)` multiplexer.
    pub fn new() -> io::Result<Self> {
        Ok(Self)
    }
}

impl Multiplexer for Poll {
    fn wait_once(&self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let events = match interest {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid pollfd array of length 1 for the duration
        // of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_millis(timeout)) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(Readiness::Ready)
    }
}

// ─── select(2) ─────────────────────────────────────────────────────────────

/// `select(2)`-backed multiplexer.
///
/// Rejects descriptors at or above `FD_SETSIZE`, a hard limit of the
/// primitive itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Select;

impl Select {
    /// Create a `select(2)` multiplexer.
    pub fn new() -> io::Result<Self> {
        Ok(Self)
    }
}

impl Multiplexer for Select {
    fn wait_once(&self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} outside select()'s FD_SETSIZE range"),
            ));
        }

        // SAFETY: an all-zero fd_set is a valid value for FD_ZERO to start from.
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        // SAFETY: fd < FD_SETSIZE is checked above, so FD_SET stays in bounds.
        unsafe {
            libc::FD_ZERO(&mut set);
            libc::FD_SET(fd, &mut set);
        }
        let (read_set, write_set) = match interest {
            Interest::Readable => (&mut set as *mut libc::fd_set, std::ptr::null_mut()),
            Interest::Writable => (std::ptr::null_mut(), &mut set as *mut libc::fd_set),
        };

        // Round the microsecond part up, matching timeout_millis, and keep
        // tv_usec inside the [0, 1_000_000) range timeval requires.
        let mut tv_sec = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
        let mut tv_usec = timeout.subsec_micros() as libc::suseconds_t
            + libc::suseconds_t::from(timeout.subsec_nanos() % 1_000 != 0);
        if tv_usec >= 1_000_000 {
            tv_sec = tv_sec.saturating_add(1);
            tv_usec = 0;
        }
        let mut tv = libc::timeval { tv_sec, tv_usec };

        // SAFETY: the fd sets point at a live fd_set (or are null) and `tv`
        // outlives the call; select may mutate both.
        let rc = unsafe {
            libc::select(fd + 1, read_set, write_set, std::ptr::null_mut(), &mut tv)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Ok(Readiness::TimedOut);
        }
        Ok(Readiness::Ready)
    }
}

// ─── epoll(7) ──────────────────────────────────────────────────────────────

/// `epoll(7)`-backed multiplexer (Linux only).
///
/// Holds one epoll instance for its lifetime; each wait registers the
/// descriptor, waits, and deregisters it. For a single-descriptor client
/// this matches `poll` in behavior while exercising the edge-triggered-free
/// level semantics of epoll.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct Epoll {
    epfd: OwnedFd,
}

#[cfg(target_os = "linux")]
impl Epoll {
    /// Create an epoll instance with close-on-exec set atomically.
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; the returned fd is owned
        // by us alone.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned open and is not owned elsewhere.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }
}

#[cfg(target_os = "linux")]
impl Multiplexer for Epoll {
    fn wait_once(&self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let events = match interest {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        };
        let mut ev = libc::epoll_event {
            events: events as u32,
            u64: u64::try_from(fd).unwrap_or(0),
        };

        // SAFETY: `ev` is a valid epoll_event and `fd` is the caller's open
        // descriptor.
        let rc = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut out = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: `out` is a valid single-element event buffer.
        let rc = unsafe {
            libc::epoll_wait(self.epfd.as_raw_fd(), &mut out, 1, timeout_millis(timeout))
        };
        let wait_err = if rc < 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };

        // Always deregister, including on EINTR, so the retry can re-add.
        // SAFETY: same descriptors as the ADD above; the event argument is
        // ignored for DEL on modern kernels but must be non-null for old ones.
        let del = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev)
        };
        if let Some(err) = wait_err {
            return Err(err);
        }
        if del < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Ok(Readiness::TimedOut);
        }
        Ok(Readiness::Ready)
    }
}

// ─── Build-time default selection ──────────────────────────────────────────

/// Backend used by [`crate::Channel::open`], selected by cargo feature.
///
/// Precedence when several features are enabled: `epoll` (Linux), then
/// `select`, then `poll`.
#[cfg(all(feature = "epoll", target_os = "linux"))]
pub type DefaultMultiplexer = Epoll;

/// Backend used by [`crate::Channel::open`], selected by cargo feature.
///
/// Precedence when several features are enabled: `epoll` (Linux), then
/// `select`, then `poll`.
#[cfg(all(
    feature = "select",
    not(all(feature = "epoll", target_os = "linux"))
))]
pub type DefaultMultiplexer = Select;

/// Backend used by [`crate::Channel::open`], selected by cargo feature.
///
/// Precedence when several features are enabled: `epoll` (Linux), then
/// `select`, then `poll`.
#[cfg(not(any(
    feature = "select",
    all(feature = "epoll", target_os = "linux")
)))]
pub type DefaultMultiplexer = Poll;
