//! The process table: 256 directly indexed slots, each owning a child pid
//! and the four stream buffers wired to it.

use crate::{conn::FrameSink, error::Error, pipebuf::PipeBuf, poll::Poller, proto::{Role, MAX_SLOTS}};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::io::RawFd;

pub struct ProcessSlot {
    /// `None` once the child has been reaped; the slot may still be
    /// flushing residual output.
    pub pid: Option<Pid>,
    pub ctrl: PipeBuf,
    pub stdin: PipeBuf,
    pub stdout: PipeBuf,
    pub stderr: PipeBuf,
}

impl ProcessSlot {
    pub fn stream_mut(&mut self, role: Role) -> &mut PipeBuf {
        match role {
            Role::Control => &mut self.ctrl,
            Role::Stdin => &mut self.stdin,
            Role::Stdout => &mut self.stdout,
            Role::Stderr => &mut self.stderr,
        }
    }

    pub fn streams_mut(&mut self) -> [&mut PipeBuf; 4] {
        [
            &mut self.ctrl,
            &mut self.stdin,
            &mut self.stdout,
            &mut self.stderr,
        ]
    }

    /// Closes all four streams without flushing.
    pub fn force_close_all(&mut self, poll: &Poller) -> Result<(), Error> {
        for pb in self.streams_mut().iter_mut() {
            pb.force_close(poll)?;
        }
        Ok(())
    }
}

pub struct ProcessTable {
    slots: Vec<Option<ProcessSlot>>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: (0..MAX_SLOTS).map(|_| None).collect(),
        }
    }

    pub fn is_busy(&self, id: u8) -> bool {
        self.slots[id as usize].is_some()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut ProcessSlot> {
        self.slots[id as usize].as_mut()
    }

    pub fn insert(&mut self, id: u8, slot: ProcessSlot) -> Result<(), Error> {
        let entry = &mut self.slots[id as usize];
        if entry.is_some() {
            return Err(Error::SlotBusy { id });
        }
        *entry = Some(slot);
        Ok(())
    }

    pub fn remove(&mut self, id: u8) -> Option<ProcessSlot> {
        self.slots[id as usize].take()
    }

    /// Daemon-side pipe fds of every live stream, for the post-fork close
    /// storm in a freshly spawned child.
    pub fn raw_fds(&mut self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            for pb in slot.streams_mut().iter() {
                if let Some(raw) = pb.raw_fd() {
                    fds.push(raw);
                }
            }
        }
        fds
    }

    fn slot_of_pid(&mut self, pid: Pid) -> Option<(u8, &mut ProcessSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find_map(|(id, entry)| match entry {
                Some(slot) if slot.pid == Some(pid) => Some((id as u8, slot)),
                _ => None,
            })
    }

    /// Harvests every zombie and reports each exit to the peer. Called after
    /// draining the signal descriptor; multiple SIGCHLDs may have coalesced
    /// into one wakeup, hence the loop.
    pub fn reap(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        loop {
            let wait_status = waitpid(None, Some(WaitPidFlag::WNOHANG));
            match wait_status {
                Ok(WaitStatus::Exited(pid, exit_code)) => {
                    self.report_exit(pid, exit_code as u8, sink)?;
                }
                Ok(WaitStatus::Signaled(pid, signal, _coredump)) => {
                    self.report_exit(pid, signal as i32 as u8, sink)?;
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(other) => unreachable!("unexpected wait status: {:?}", other),
                Err(err) if err.as_errno() == Some(nix::errno::Errno::ECHILD) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn report_exit(
        &mut self,
        pid: Pid,
        status: u8,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        // a child reaped synchronously by a slot CLOSE no longer has a slot
        if let Some((id, slot)) = self.slot_of_pid(pid) {
            slot.pid = None;
            tracing::debug!(id, pid = pid.as_raw(), status, "child exited");
            sink.send_exit_status(id, status)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::Fd;

    fn dummy_slot(id: u8, poll: &Poller) -> ProcessSlot {
        let (ctrl_r, ctrl_w) = Fd::pipe().unwrap();
        let (stdin_r, stdin_w) = Fd::pipe().unwrap();
        let (stdout_r, stdout_w) = Fd::pipe().unwrap();
        let (stderr_r, stderr_w) = Fd::pipe().unwrap();
        // keep the opposite ends alive for the duration of the test
        std::mem::forget((ctrl_r, stdin_r, stdout_w, stderr_w));
        ProcessSlot {
            pid: None,
            ctrl: PipeBuf::new(id, Role::Control, ctrl_w, 1, poll).unwrap(),
            stdin: PipeBuf::new(id, Role::Stdin, stdin_w, 2, poll).unwrap(),
            stdout: PipeBuf::new(id, Role::Stdout, stdout_r, 3, poll).unwrap(),
            stderr: PipeBuf::new(id, Role::Stderr, stderr_r, 4, poll).unwrap(),
        }
    }

    #[test]
    fn insert_rejects_busy_slot() {
        let poll = Poller::new().unwrap();
        let mut table = ProcessTable::new();
        table.insert(4, dummy_slot(4, &poll)).unwrap();
        match table.insert(4, dummy_slot(4, &poll)) {
            Err(Error::SlotBusy { id: 4 }) => {}
            other => panic!("expected SlotBusy, got {:?}", other),
        }
    }

    #[test]
    fn remove_frees_the_slot() {
        let poll = Poller::new().unwrap();
        let mut table = ProcessTable::new();
        table.insert(9, dummy_slot(9, &poll)).unwrap();
        assert!(table.is_busy(9));
        let mut slot = table.remove(9).unwrap();
        slot.force_close_all(&poll).unwrap();
        assert!(!table.is_busy(9));
        assert!(table.get_mut(9).is_none());
    }

    #[test]
    fn raw_fds_lists_only_open_streams() {
        let poll = Poller::new().unwrap();
        let mut table = ProcessTable::new();
        table.insert(1, dummy_slot(1, &poll)).unwrap();
        table.insert(2, dummy_slot(2, &poll)).unwrap();
        assert_eq!(table.raw_fds().len(), 8);

        table.get_mut(1).unwrap().force_close_all(&poll).unwrap();
        assert_eq!(table.raw_fds().len(), 4);
    }
}
