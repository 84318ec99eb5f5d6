//! Local endpoint construction for the control channel.
//!
//! A datagram client must bind its own named endpoint or the peer has no
//! address to reply to. Paths are a pure function of the runtime directory,
//! an injected process identity, and a per-binder attempt counter — no
//! hidden global state — so collision handling is deterministic and
//! testable. The bound filesystem node is unlinked when the owning
//! [`Endpoint`] drops; failure to unlink is logged, never fatal.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

/// Bind attempts before giving up with [`Error::BindExhausted`].
pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;

/// A bound local UNIX-datagram endpoint: descriptor plus filesystem path.
///
/// Single-owner: the descriptor is never duplicated or shared. Dropping the
/// endpoint closes the descriptor and removes the socket node.
#[derive(Debug)]
pub struct Endpoint {
    fd: OwnedFd,
    path: PathBuf,
}

impl Endpoint {
    /// Filesystem path of the bound socket.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!(
                    "[binder] failed to unlink local endpoint {}: {err}",
                    self.path.display()
                );
            }
        }
        // OwnedFd closes the descriptor.
    }
}

/// Generates collision-resistant local socket paths and binds to them.
#[derive(Debug)]
pub struct AddressBinder {
    runtime_dir: PathBuf,
    ident: u32,
    counter: AtomicU32,
    max_attempts: u32,
}

impl AddressBinder {
    /// Binder rooted at `runtime_dir`, using the current process ID as the
    /// identity component.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            ident: std::process::id(),
            counter: AtomicU32::new(0),
            max_attempts: DEFAULT_BIND_ATTEMPTS,
        }
    }

    /// Override the identity component (tests inject a fixed value to make
    /// generated paths predictable).
    pub fn with_ident(mut self, ident: u32) -> Self {
        self.ident = ident;
        self
    }

    /// Override the bind retry bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Create a UNIX-datagram socket and bind it to a fresh generated path.
    ///
    /// On an address collision the counter advances and a new path is tried,
    /// up to the configured bound.
    ///
    /// # Errors
    ///
    /// [`Error::BindExhausted`] after `max_attempts` collisions; any other
    /// bind failure propagates immediately as [`Error::System`].
    pub fn bind(&self) -> Result<Endpoint> {
        for _ in 0..self.max_attempts {
            let attempt = self.counter.fetch_add(1, Ordering::Relaxed);
            let path = local_socket_path(&self.runtime_dir, self.ident, attempt);
            let (addr, addr_len) = sockaddr_un(&path)?;
            let fd = socket_dgram()?;

            // SAFETY: `addr` is a fully initialized sockaddr_un and
            // `addr_len` covers exactly its populated prefix.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                    addr_len,
                )
            };
            if rc == 0 {
                log::debug!("[binder] bound local endpoint {}", path.display());
                return Ok(Endpoint { fd, path });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EADDRINUSE) {
                log::debug!("[binder] {} already in use, retrying", path.display());
                continue;
            }
            return Err(Error::System(err));
        }
        Err(Error::BindExhausted {
            attempts: self.max_attempts,
        })
    }
}

/// Local socket path for a given identity and attempt counter.
///
/// Pure function: `{dir}/ctrl_{ident}-{attempt}`.
pub(crate) fn local_socket_path(dir: &Path, ident: u32, attempt: u32) -> PathBuf {
    dir.join(format!("ctrl_{ident}-{attempt}"))
}

/// Create an `AF_UNIX`/`SOCK_DGRAM` socket, non-blocking and close-on-exec.
///
/// Platforms with `SOCK_NONBLOCK`/`SOCK_CLOEXEC` get both atomically at
/// creation, closing the race between `socket` and a following `fcntl`;
/// elsewhere the flags are applied in a separate step.
pub(crate) fn socket_dgram() -> io::Result<OwnedFd> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    let ty = libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    let ty = libc::SOCK_DGRAM;

    // SAFETY: socket takes no pointers; a non-negative return is an open
    // descriptor owned by us alone.
    let fd = unsafe { libc::socket(libc::AF_UNIX, ty, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned open and is not owned elsewhere.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    {
        // SAFETY: fd is open; F_GETFL/F_SETFL and F_SETFD take no pointers.
        unsafe {
            let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
            if flags < 0
                || libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
                || libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(fd)
}

/// Build a `sockaddr_un` for `path`, validating it fits in `sun_path`.
pub(crate) fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();

    // SAFETY: sockaddr_un is a plain C struct; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    // Leave room for the terminating NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "socket path too long ({} bytes, max {}): {}",
                bytes.len(),
                addr.sun_path.len() - 1,
                path.display()
            ),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn path_generation_is_pure_and_distinct() {
        let dir = Path::new("/run/ctrl");
        assert_eq!(
            local_socket_path(dir, 42, 0),
            PathBuf::from("/run/ctrl/ctrl_42-0")
        );
        assert_ne!(
            local_socket_path(dir, 42, 0),
            local_socket_path(dir, 42, 1)
        );
        assert_ne!(
            local_socket_path(dir, 42, 0),
            local_socket_path(dir, 43, 0)
        );
    }

    #[test]
    fn bind_creates_socket_node_and_drop_removes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binder = AddressBinder::new(dir.path());
        let endpoint = binder.bind().expect("bind");

        let meta = std::fs::metadata(endpoint.path()).expect("socket node exists");
        assert!(meta.file_type().is_socket());

        let path = endpoint.path().to_path_buf();
        drop(endpoint);
        assert!(!path.exists(), "drop must unlink the socket node");
    }

    #[test]
    fn collision_advances_the_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binder = AddressBinder::new(dir.path()).with_ident(7);

        // Occupy the first generated path with a real socket.
        let occupied = local_socket_path(dir.path(), 7, 0);
        let _squatter = UnixDatagram::bind(&occupied).expect("occupy path");

        let endpoint = binder.bind().expect("bind must retry past collision");
        assert_eq!(endpoint.path(), local_socket_path(dir.path(), 7, 1));
    }

    #[test]
    fn exhaustion_after_bounded_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binder = AddressBinder::new(dir.path()).with_ident(9).with_max_attempts(2);

        let _s0 = UnixDatagram::bind(local_socket_path(dir.path(), 9, 0)).expect("occupy 0");
        let _s1 = UnixDatagram::bind(local_socket_path(dir.path(), 9, 1)).expect("occupy 1");

        match binder.bind() {
            Err(Error::BindExhausted { attempts }) => assert_eq!(attempts, 2),
            other => panic!("expected BindExhausted, got {other:?}"),
        }
    }

    #[test]
    fn missing_runtime_dir_is_not_exhaustion() {
        let binder = AddressBinder::new("/nonexistent-ctrlgram-dir");
        assert!(matches!(binder.bind(), Err(Error::System(_))));
    }

    #[test]
    fn overlong_path_is_rejected_before_any_syscall() {
        let long = "x".repeat(200);
        let err = sockaddr_un(Path::new(&long)).expect_err("must reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn created_socket_is_nonblocking() {
        let fd = socket_dgram().expect("socket");
        // SAFETY: fd is open; F_GETFL takes no pointers.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0, "socket must be non-blocking");
    }
}
