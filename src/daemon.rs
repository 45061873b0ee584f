//! The daemon core: one epoll loop demultiplexing the control socket, the
//! signal descriptor and every stream buffer of every slot.

use crate::{
    conn::{Connection, FrameSink},
    error::Error,
    fd::Fd,
    launcher,
    pipebuf::PipeBuf,
    poll::{Poller, Token, MAX_EVENTS},
    proto::{
        classify_stream, Direction, Header, Role, StreamOp, CMD_CLOSE, CMD_KILL, CMD_OPEN,
        CMD_RESET, MAX_WRITE, RING_SIZE,
    },
    table::{ProcessSlot, ProcessTable},
};
use nix::sys::epoll::{EpollEvent, EpollFlags};
use nix::sys::signal::{
    kill, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::ForkResult;
use std::convert::TryFrom;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

pub struct Daemon {
    poll: Poller,
    conn: Connection,
    signals: SignalFd,
    table: ProcessTable,
    next_gen: u32,
}

impl Daemon {
    /// Builds a daemon around an already connected control socket.
    ///
    /// SIGCHLD is blocked and routed to a signal descriptor; SIGPIPE is
    /// ignored so a dead child surfaces as EPIPE on its pipe instead of
    /// killing the daemon.
    pub fn new(sock: UnixStream) -> Result<Daemon, Error> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // Safety: ignoring SIGPIPE installs no handler code
        unsafe {
            sigaction(Signal::SIGPIPE, &ignore)?;
        }

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;

        let conn = Connection::new(sock)?;
        let poll = Poller::new()?;
        poll.add(conn.as_raw_fd(), EpollFlags::EPOLLIN, Token::Socket)?;
        poll.add(signals.as_raw_fd(), EpollFlags::EPOLLIN, Token::Signals)?;

        Ok(Daemon {
            poll,
            conn,
            signals,
            table: ProcessTable::new(),
            next_gen: 0,
        })
    }

    pub fn connect(path: &Path) -> Result<Daemon, Error> {
        Daemon::new(UnixStream::connect(path)?)
    }

    /// Runs until the peer requests shutdown. `Ok(())` means a clean RESET;
    /// every error is fatal and maps to a non-zero exit.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = self.poll.wait(&mut events)?;
            for ev in &events[..n] {
                match Token::decode(ev.data()) {
                    Some(Token::Socket) => {
                        if self.handle_frame()? {
                            return Ok(());
                        }
                    }
                    Some(Token::Signals) => self.handle_sigchld()?,
                    Some(Token::Stream { id, role, gen }) => {
                        self.handle_stream(id, role, gen, ev.events())?
                    }
                    None => {}
                }
            }
        }
    }

    /// Processes one complete frame from the peer. Returns `true` when the
    /// peer requested shutdown.
    fn handle_frame(&mut self) -> Result<bool, Error> {
        let hdr = self.conn.read_header()?;
        tracing::trace!(cmd = hdr.cmd, id = hdr.id, arg = hdr.arg, len = hdr.len, "frame");
        match hdr.cmd {
            CMD_RESET => {
                tracing::info!("reset requested, shutting down");
                return Ok(true);
            }
            CMD_OPEN => self.open_slot(hdr.id)?,
            CMD_CLOSE => self.close_slot(hdr.id)?,
            CMD_KILL => self.kill_slot(hdr.id, hdr.arg)?,
            cmd => match classify_stream(cmd) {
                Some((StreamOp::Write, role)) => self.stream_write(hdr, role)?,
                Some((StreamOp::Ack, role)) => self.stream_ack(hdr, role)?,
                Some((StreamOp::Close, role)) => self.stream_close(hdr.id, role)?,
                None => return Err(Error::UnknownCommand { cmd }),
            },
        }
        Ok(false)
    }

    fn stream_write(&mut self, hdr: Header, role: Role) -> Result<(), Error> {
        let mut payload = [0u8; MAX_WRITE];
        let data = self.conn.read_payload(&mut payload, hdr.len)?;
        if role.direction() != Direction::ToChild {
            return Err(Error::UnexpectedFrame {
                cmd: hdr.cmd,
                id: hdr.id,
            });
        }
        let slot = self
            .table
            .get_mut(hdr.id)
            .ok_or(Error::NoSuchSlot { id: hdr.id })?;
        slot.stream_mut(role).accept_payload(data, &self.poll)
    }

    fn stream_ack(&mut self, hdr: Header, role: Role) -> Result<(), Error> {
        let grant = self.conn.read_credit()?;
        if role.direction() != Direction::FromChild {
            return Err(Error::UnexpectedFrame {
                cmd: hdr.cmd,
                id: hdr.id,
            });
        }
        let slot = self
            .table
            .get_mut(hdr.id)
            .ok_or(Error::NoSuchSlot { id: hdr.id })?;
        slot.stream_mut(role)
            .add_credit(grant, &mut self.conn, &self.poll)
    }

    fn stream_close(&mut self, id: u8, role: Role) -> Result<(), Error> {
        let slot = self.table.get_mut(id).ok_or(Error::NoSuchSlot { id })?;
        match role.direction() {
            Direction::ToChild => slot.stream_mut(role).close_from_peer(&self.poll),
            Direction::FromChild => {
                // the daemon alone decides when child output ends
                tracing::debug!(id, ?role, "ignoring peer close for child-owned stream");
                Ok(())
            }
        }
    }

    fn handle_stream(
        &mut self,
        id: u8,
        role: Role,
        gen: u32,
        flags: EpollFlags,
    ) -> Result<(), Error> {
        let slot = match self.table.get_mut(id) {
            Some(slot) => slot,
            None => return Ok(()), // slot torn down earlier in this batch
        };
        let pb = slot.stream_mut(role);
        if pb.generation() != gen || !pb.is_open() {
            return Ok(());
        }
        if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLERR) {
            pb.note_hangup();
        }
        match role.direction() {
            Direction::ToChild => pb.drain_to_child(&mut self.conn, &self.poll),
            Direction::FromChild => pb.fill_from_child(&mut self.conn, &self.poll),
        }
    }

    fn handle_sigchld(&mut self) -> Result<(), Error> {
        // several SIGCHLDs coalesce into one wakeup; drain the queue fully,
        // then reap everything in one pass
        loop {
            match self.signals.read_signal() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.table.reap(&mut self.conn)
    }

    fn open_slot(&mut self, id: u8) -> Result<(), Error> {
        if self.table.is_busy(id) {
            return Err(Error::SlotBusy { id });
        }
        let (ctrl_r, ctrl_w) = Fd::pipe()?;
        let (stdin_r, stdin_w) = Fd::pipe()?;
        let (stdout_r, stdout_w) = Fd::pipe()?;
        let (stderr_r, stderr_w) = Fd::pipe()?;

        match unsafe { nix::unistd::fork() }? {
            ForkResult::Child => {
                self.shed_into_child();
                drop(ctrl_w);
                drop(stdin_w);
                drop(stdout_r);
                drop(stderr_r);
                launcher::run(ctrl_r, stdin_r, stdout_w, stderr_w)
            }
            ForkResult::Parent { child } => {
                drop(ctrl_r);
                drop(stdin_r);
                drop(stdout_w);
                drop(stderr_w);
                let slot = ProcessSlot {
                    pid: Some(child),
                    ctrl: self.make_stream(id, Role::Control, ctrl_w)?,
                    stdin: self.make_stream(id, Role::Stdin, stdin_w)?,
                    stdout: self.make_stream(id, Role::Stdout, stdout_r)?,
                    stderr: self.make_stream(id, Role::Stderr, stderr_r)?,
                };
                self.table.insert(id, slot)?;
                // seed the peer's send window for both to-child streams
                self.conn.send_ack(id, Role::Control, RING_SIZE as u32)?;
                self.conn.send_ack(id, Role::Stdin, RING_SIZE as u32)?;
                tracing::debug!(id, pid = child.as_raw(), "spawned child");
                Ok(())
            }
        }
    }

    fn make_stream(&mut self, id: u8, role: Role, end: Fd) -> Result<PipeBuf, Error> {
        self.next_gen = self.next_gen.wrapping_add(1);
        PipeBuf::new(id, role, end, self.next_gen, &self.poll)
    }

    /// Post-fork hygiene: the child must not hold any daemon-side fd, or
    /// EOF would never propagate on other slots' pipes.
    fn shed_into_child(&mut self) {
        for raw in self.table.raw_fds() {
            nix::unistd::close(raw).ok();
        }
        nix::unistd::close(self.conn.as_raw_fd()).ok();
        nix::unistd::close(self.poll.as_raw()).ok();
        nix::unistd::close(self.signals.as_raw_fd()).ok();
    }

    fn close_slot(&mut self, id: u8) -> Result<(), Error> {
        let mut slot = self.table.remove(id).ok_or(Error::NoSuchSlot { id })?;
        if let Some(pid) = slot.pid.take() {
            kill(pid, Signal::SIGKILL).ok();
            nix::sys::wait::waitpid(pid, None)?;
        }
        slot.force_close_all(&self.poll)?;
        self.conn.send_close_ack(id)?;
        tracing::debug!(id, "slot closed");
        Ok(())
    }

    fn kill_slot(&mut self, id: u8, signo: u8) -> Result<(), Error> {
        let slot = self.table.get_mut(id).ok_or(Error::NoSuchSlot { id })?;
        if let Some(pid) = slot.pid {
            let sig = Signal::try_from(i32::from(signo))
                .map_err(|_| Error::BadSignal { signo })?;
            kill(pid, sig)?;
            tracing::debug!(id, signo, "signal delivered");
        }
        Ok(())
    }
}
