//! Readiness notification.
//!
//! Every registered descriptor carries a [`Token`] in its epoll data word so
//! dispatch is a single decode. Stream tokens embed a generation stamp:
//! events already harvested for a slot that was torn down in the same batch
//! decode to a stale generation and are dropped instead of touching the new
//! occupant.

use crate::{error::Error, fd::Fd, proto::Role};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::os::unix::io::RawFd;

/// Upper bound on events harvested per wakeup.
pub const MAX_EVENTS: usize = 64;

const KIND_SOCKET: u64 = 0;
const KIND_SIGNALS: u64 = 1;
const KIND_STREAM: u64 = 2;

/// What a readiness event is about.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Token {
    /// The control socket.
    Socket,
    /// The signal descriptor.
    Signals,
    /// One stream buffer of one slot.
    Stream { id: u8, role: Role, gen: u32 },
}

impl Token {
    pub fn encode(self) -> u64 {
        match self {
            Token::Socket => KIND_SOCKET << 56,
            Token::Signals => KIND_SIGNALS << 56,
            Token::Stream { id, role, gen } => {
                (KIND_STREAM << 56)
                    | (u64::from(id) << 40)
                    | (u64::from(role.index()) << 32)
                    | u64::from(gen)
            }
        }
    }

    pub fn decode(raw: u64) -> Option<Token> {
        match raw >> 56 {
            KIND_SOCKET => Some(Token::Socket),
            KIND_SIGNALS => Some(Token::Signals),
            KIND_STREAM => {
                let id = (raw >> 40) as u8;
                let role = Role::from_index((raw >> 32) as u8 & 0x0f)?;
                let gen = raw as u32;
                Some(Token::Stream { id, role, gen })
            }
            _ => None,
        }
    }
}

/// Thin wrapper over an epoll instance.
pub struct Poller {
    epfd: Fd,
}

impl Poller {
    pub fn new() -> Result<Poller, Error> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Poller { epfd: Fd::new(epfd) })
    }

    pub fn as_raw(&self) -> RawFd {
        self.epfd.as_raw()
    }

    pub fn add(&self, fd: RawFd, flags: EpollFlags, token: Token) -> Result<(), Error> {
        let mut ev = EpollEvent::new(flags, token.encode());
        epoll_ctl(self.epfd.as_raw(), EpollOp::EpollCtlAdd, fd, Some(&mut ev))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, flags: EpollFlags, token: Token) -> Result<(), Error> {
        let mut ev = EpollEvent::new(flags, token.encode());
        epoll_ctl(self.epfd.as_raw(), EpollOp::EpollCtlMod, fd, Some(&mut ev))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> Result<(), Error> {
        epoll_ctl(self.epfd.as_raw(), EpollOp::EpollCtlDel, fd, None)?;
        Ok(())
    }

    /// Blocks until at least one descriptor is ready. EINTR restarts the
    /// wait; any other failure is fatal to the caller.
    pub fn wait(&self, events: &mut [EpollEvent]) -> Result<usize, Error> {
        loop {
            match epoll_wait(self.epfd.as_raw(), events, -1) {
                Ok(n) => return Ok(n),
                Err(err) if err.as_errno() == Some(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
