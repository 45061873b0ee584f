//! Owned file descriptors for the daemon's pipe ends and kernel objects.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::{io, os::unix::io::RawFd};

/// An owned descriptor, closed on drop.
///
/// Wraps the daemon-side pipe ends as well as the epoll instance. Reads and
/// writes surface EAGAIN as `ErrorKind::WouldBlock`, which the flow-control
/// code treats as the end of the current batch.
pub struct Fd(RawFd);

impl Fd {
    pub fn new(raw: RawFd) -> Fd {
        Fd(raw)
    }

    /// Creates a pipe with both ends close-on-exec. Returns `(read, write)`.
    pub fn pipe() -> nix::Result<(Fd, Fd)> {
        let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok((Fd(r), Fd(w)))
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    /// Daemon-side pipe ends run non-blocking; the child's ends stay
    /// blocking.
    pub fn set_nonblocking(&self) -> nix::Result<()> {
        fcntl(self.0, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map(drop)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(io_error)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(io_error)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        nix::unistd::close(self.0).ok();
    }
}

fn io_error(err: nix::Error) -> io::Error {
    match err.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, err),
    }
}
