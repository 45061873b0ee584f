//! Per-stream buffering and credit-based flow control.
//!
//! Every stream of every slot owns one `PipeBuf`: a 4096-byte ring between
//! the control socket and one end of the child's pipe, plus the credit
//! counter that bounds how far the sender may run ahead of the receiver.
//!
//! To-child streams accept peer payload into the ring and drain it into the
//! child pipe, granting the peer one credit per drained byte. From-child
//! streams read the pipe into the ring and forward it as WRITE frames, but
//! only up to the credit the peer has granted; with no credit the bytes wait
//! in the ring.

use crate::{
    conn::FrameSink,
    error::Error,
    fd::Fd,
    poll::{Poller, Token},
    proto::{Direction, Role, MAX_WRITE, RING_SIZE},
};
use nix::sys::epoll::EpollFlags;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;

pub struct PipeBuf {
    id: u8,
    role: Role,
    gen: u32,
    /// Daemon-side pipe end; `None` once the stream is finished.
    fd: Option<Fd>,
    buf: Box<[u8; RING_SIZE]>,
    start: usize,
    count: usize,
    /// Bytes the other side has authorized in this direction.
    credit: usize,
    eof: bool,
    hup_seen: bool,
    /// Current epoll membership: `None` = not in the interest set,
    /// `Some(flags)` = in the set with that event mask.
    mask: Option<EpollFlags>,
}

impl PipeBuf {
    pub fn new(id: u8, role: Role, fd: Fd, gen: u32, poll: &Poller) -> Result<PipeBuf, Error> {
        fd.set_nonblocking()?;
        let mut pb = PipeBuf {
            id,
            role,
            gen,
            fd: Some(fd),
            buf: Box::new([0u8; RING_SIZE]),
            start: 0,
            count: 0,
            credit: 0,
            eof: false,
            hup_seen: false,
            mask: None,
        };
        // from-child streams enter the interest set right away (mask empty)
        // so a hangup is seen even before the peer grants any credit
        pb.sync(poll)?;
        Ok(pb)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.role.direction()
    }

    pub fn generation(&self) -> u32 {
        self.gen
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw())
    }

    pub fn buffered(&self) -> usize {
        self.count
    }

    pub fn credit(&self) -> usize {
        self.credit
    }

    pub fn events_mask(&self) -> Option<EpollFlags> {
        self.mask
    }

    /// Records that the kernel flagged HUP/ERR for this stream's fd.
    pub fn note_hangup(&mut self) {
        self.hup_seen = true;
    }

    /// Copies a WRITE payload from the peer into the ring.
    ///
    /// The peer's window is exactly the ring's free space, so a payload that
    /// does not fit means the peer sent more than it was ever granted.
    pub fn accept_payload(&mut self, data: &[u8], poll: &Poller) -> Result<(), Error> {
        debug_assert_eq!(self.direction(), Direction::ToChild);
        if self.eof || self.fd.is_none() {
            return Err(Error::StreamClosed {
                id: self.id,
                role: self.role,
            });
        }
        let free = RING_SIZE - self.count;
        if data.len() > free {
            return Err(Error::CreditOverrun {
                id: self.id,
                role: self.role,
                excess: data.len() - free,
            });
        }
        self.push(data);
        self.sync(poll)
    }

    /// Moves ring contents into the child pipe, granting the peer one credit
    /// per byte that actually left the ring.
    pub fn drain_to_child(
        &mut self,
        sink: &mut dyn FrameSink,
        poll: &Poller,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.direction(), Direction::ToChild);
        let mut moved = 0usize;
        let mut broken = false;
        while self.count > 0 {
            let (ofs, len) = self.data_run();
            let res = match self.fd.as_ref() {
                Some(fd) => fd.write(&self.buf[ofs..ofs + len]),
                None => break,
            };
            match res {
                Ok(n) => {
                    self.pop(n);
                    moved += n;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::BrokenPipe => {
                    broken = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if moved > 0 {
            sink.send_ack(self.id, self.role, moved as u32)?;
        }
        if broken {
            // child is gone; nothing will ever read the residue
            tracing::debug!(
                id = self.id,
                role = ?self.role,
                dropped = self.count,
                "child pipe broken, releasing stream"
            );
            self.release(poll)?;
        } else if self.count == 0 && self.eof {
            self.release(poll)?;
        } else {
            self.sync(poll)?;
        }
        Ok(())
    }

    /// Peer half-closed this to-child stream. Residual ring bytes still
    /// reach the child; the fd is released once the ring drains. Repeats
    /// are ignored.
    pub fn close_from_peer(&mut self, poll: &Poller) -> Result<(), Error> {
        debug_assert_eq!(self.direction(), Direction::ToChild);
        if self.fd.is_none() || self.eof {
            return Ok(());
        }
        self.eof = true;
        if self.count == 0 {
            self.release(poll)?;
        }
        Ok(())
    }

    /// ACK from the peer: widen the window and forward whatever was waiting
    /// on it. A grant arriving after this stream closed crossed our CLOSE
    /// frame on the wire and is ignored.
    pub fn add_credit(
        &mut self,
        grant: u32,
        sink: &mut dyn FrameSink,
        poll: &Poller,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.direction(), Direction::FromChild);
        self.credit = self.credit.saturating_add(grant as usize);
        if self.fd.is_none() {
            return Ok(());
        }
        self.forward(sink)?;
        self.finish_inbound(sink, poll)
    }

    /// Child pipe became readable (or hung up): read until EAGAIN, EOF or a
    /// full ring, then forward as far as credit permits.
    pub fn fill_from_child(
        &mut self,
        sink: &mut dyn FrameSink,
        poll: &Poller,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.direction(), Direction::FromChild);
        if self.fd.is_none() {
            return Ok(());
        }
        while !self.eof {
            let (ofs, len) = self.free_run();
            if len == 0 {
                break;
            }
            let res = match self.fd.as_ref() {
                Some(fd) => fd.read(&mut self.buf[ofs..ofs + len]),
                None => break,
            };
            match res {
                Ok(0) => self.eof = true,
                Ok(n) => self.count += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.forward(sink)?;
        self.finish_inbound(sink, poll)
    }

    /// Drops the fd without flushing. Used when the whole slot is torn down.
    pub fn force_close(&mut self, poll: &Poller) -> Result<(), Error> {
        self.release(poll)
    }

    fn forward(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        while self.count > 0 && self.credit > 0 {
            let (ofs, len) = self.data_run();
            let take = len.min(self.credit).min(MAX_WRITE);
            sink.send_data(self.id, self.role, &self.buf[ofs..ofs + take])?;
            self.pop(take);
            self.credit -= take;
        }
        Ok(())
    }

    fn finish_inbound(&mut self, sink: &mut dyn FrameSink, poll: &Poller) -> Result<(), Error> {
        if self.fd.is_some() && self.eof && self.count == 0 {
            sink.send_stream_close(self.id, self.role)?;
            self.release(poll)?;
            return Ok(());
        }
        self.sync(poll)
    }

    fn token(&self) -> Token {
        Token::Stream {
            id: self.id,
            role: self.role,
            gen: self.gen,
        }
    }

    fn desired_mask(&self) -> Option<EpollFlags> {
        if self.fd.is_none() {
            return None;
        }
        match self.direction() {
            Direction::ToChild => {
                if self.count > 0 {
                    Some(EpollFlags::EPOLLOUT)
                } else {
                    None
                }
            }
            Direction::FromChild => {
                if self.eof {
                    None
                } else if self.credit > 0 {
                    Some(EpollFlags::EPOLLIN)
                } else if self.hup_seen {
                    // HUP keeps firing while data waits for credit; leave
                    // the set and come back on the next grant
                    None
                } else {
                    Some(EpollFlags::empty())
                }
            }
        }
    }

    fn sync(&mut self, poll: &Poller) -> Result<(), Error> {
        let desired = self.desired_mask();
        let raw = match self.fd.as_ref() {
            Some(fd) => fd.as_raw(),
            None => return Ok(()),
        };
        match (self.mask, desired) {
            (None, None) => {}
            (Some(cur), Some(want)) if cur == want => {}
            (None, Some(want)) => {
                poll.add(raw, want, self.token())?;
                self.mask = Some(want);
            }
            (Some(_), Some(want)) => {
                poll.modify(raw, want, self.token())?;
                self.mask = Some(want);
            }
            (Some(_), None) => {
                poll.delete(raw)?;
                self.mask = None;
            }
        }
        Ok(())
    }

    /// Deregisters, then closes the fd. The order matters: an fd must never
    /// be closed while still in the interest set.
    fn release(&mut self, poll: &Poller) -> Result<(), Error> {
        if let Some(fd) = self.fd.take() {
            if self.mask.take().is_some() {
                poll.delete(fd.as_raw())?;
            }
        }
        self.count = 0;
        Ok(())
    }

    fn data_run(&self) -> (usize, usize) {
        (self.start, self.count.min(RING_SIZE - self.start))
    }

    fn free_run(&self) -> (usize, usize) {
        let end = (self.start + self.count) % RING_SIZE;
        let free = RING_SIZE - self.count;
        (end, free.min(RING_SIZE - end))
    }

    fn push(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let (ofs, len) = self.free_run();
            let take = len.min(data.len());
            self.buf[ofs..ofs + take].copy_from_slice(&data[..take]);
            self.count += take;
            data = &data[take..];
        }
    }

    fn pop(&mut self, n: usize) {
        debug_assert!(n <= self.count);
        self.start = (self.start + n) % RING_SIZE;
        self.count -= n;
    }
}
