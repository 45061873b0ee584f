//! End-to-end protocol sessions against a live daemon.
//!
//! The daemon runs in a forked child on one end of a socketpair while the
//! test plays the peer on the other end, so a wedged daemon shows up as a
//! read timeout instead of a hung test run.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;
use usbexecd::proto::{
    ack_cmd, close_cmd, write_cmd, Role, CMD_CLOSE, CMD_CLOSE_ACK, CMD_EXIT_STATUS, CMD_KILL,
    CMD_OPEN, CMD_RESET, MAX_WRITE, RING_SIZE,
};
use usbexecd::Daemon;

struct Peer {
    sock: UnixStream,
}

#[derive(Debug)]
struct Frame {
    cmd: u8,
    id: u8,
    arg: u8,
    payload: Vec<u8>,
}

impl Peer {
    fn new(sock: UnixStream) -> Peer {
        sock.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        sock.set_write_timeout(Some(Duration::from_secs(30))).unwrap();
        Peer { sock }
    }

    fn send(&mut self, cmd: u8, id: u8, arg: u8, payload: &[u8]) {
        assert!(payload.len() <= MAX_WRITE);
        let mut frame = vec![cmd, id, arg, payload.len() as u8];
        frame.extend_from_slice(payload);
        self.sock.write_all(&frame).unwrap();
    }

    fn ack(&mut self, role: Role, id: u8, credit: u32) {
        let mut frame = vec![ack_cmd(role), id, 0, 4];
        frame.extend_from_slice(&credit.to_le_bytes());
        self.sock.write_all(&frame).unwrap();
    }

    fn recv(&mut self) -> Frame {
        let mut hdr = [0u8; 4];
        self.sock.read_exact(&mut hdr).unwrap();
        let mut payload = vec![0u8; hdr[3] as usize];
        self.sock.read_exact(&mut payload).unwrap();
        Frame {
            cmd: hdr[0],
            id: hdr[1],
            arg: hdr[2],
            payload,
        }
    }

    /// OPEN plus the two window-seeding ACKs the daemon answers with.
    fn open(&mut self, id: u8) {
        self.send(CMD_OPEN, id, 0, &[]);
        let ctrl = self.recv();
        assert_eq!((ctrl.cmd, ctrl.id), (ack_cmd(Role::Control), id));
        assert_eq!(ctrl.payload, (RING_SIZE as u32).to_le_bytes());
        let stdin = self.recv();
        assert_eq!((stdin.cmd, stdin.id), (ack_cmd(Role::Stdin), id));
        assert_eq!(stdin.payload, (RING_SIZE as u32).to_le_bytes());
    }

    /// Reads until the daemon's end of the socket closes, discarding any
    /// frames still in flight.
    fn expect_eof(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            if self.sock.read(&mut buf).unwrap() == 0 {
                return;
            }
        }
    }
}

fn spawn_daemon() -> (Peer, Pid) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    match unsafe { nix::unistd::fork() }.unwrap() {
        ForkResult::Child => {
            drop(ours);
            let code = match Daemon::new(theirs).and_then(|mut d| d.run()) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(theirs);
            (Peer::new(ours), child)
        }
    }
}

fn assert_exit_code(pid: Pid, expected: i32) {
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, code) => assert_eq!(code, expected),
        other => panic!("daemon did not exit normally: {:?}", other),
    }
}

fn is_ack(cmd: u8) -> bool {
    cmd == ack_cmd(Role::Control) || cmd == ack_cmd(Role::Stdin)
}

fn echo_round_trip(peer: &mut Peer) {
    peer.open(7);
    peer.send(write_cmd(Role::Control), 7, 0, b"/bin/cat\0");
    peer.send(close_cmd(Role::Control), 7, 0, &[]);
    peer.ack(Role::Stdout, 7, 16);
    peer.send(write_cmd(Role::Stdin), 7, 0, b"hello\n");
    peer.send(close_cmd(Role::Stdin), 7, 0, &[]);

    let mut stdout_bytes = Vec::new();
    let mut exit = None;
    let mut closed_out = false;
    let mut closed_err = false;
    while !(closed_out && closed_err && exit.is_some()) {
        let frame = peer.recv();
        assert_eq!(frame.id, 7);
        match frame.cmd {
            c if c == write_cmd(Role::Stdout) => stdout_bytes.extend_from_slice(&frame.payload),
            c if c == close_cmd(Role::Stdout) => closed_out = true,
            c if c == close_cmd(Role::Stderr) => closed_err = true,
            CMD_EXIT_STATUS => exit = Some(frame.arg),
            c if is_ack(c) => {}
            other => panic!("unexpected frame {:#04x}", other),
        }
    }
    assert_eq!(stdout_bytes, b"hello\n");
    assert_eq!(exit, Some(0));
}

fn kill_mid_stream(peer: &mut Peer) {
    peer.open(2);
    peer.send(write_cmd(Role::Control), 2, 0, b"/bin/sleep\0100\0");
    peer.send(close_cmd(Role::Control), 2, 0, &[]);
    peer.send(CMD_KILL, 2, 15, &[]);

    loop {
        let frame = peer.recv();
        assert_eq!(frame.id, 2);
        match frame.cmd {
            CMD_EXIT_STATUS => {
                assert_eq!(frame.arg, 15);
                break;
            }
            c if is_ack(c) => {}
            c if c == close_cmd(Role::Stdout) || c == close_cmd(Role::Stderr) => {}
            other => panic!("unexpected frame {:#04x}", other),
        }
    }

    // the slot is torn down on request even after the child is gone; stream
    // close frames may still be in flight ahead of the acknowledgment
    peer.send(CMD_CLOSE, 2, 0, &[]);
    loop {
        let frame = peer.recv();
        assert_eq!(frame.id, 2);
        match frame.cmd {
            CMD_CLOSE_ACK => break,
            c if c == close_cmd(Role::Stdout) || c == close_cmd(Role::Stderr) => {}
            c if is_ack(c) => {}
            other => panic!("unexpected frame after CLOSE {:#04x}", other),
        }
    }
}

fn close_with_pending_output(peer: &mut Peer) {
    peer.open(3);
    peer.send(
        write_cmd(Role::Control),
        3,
        0,
        b"/bin/sh\0-c\0yes | head -c 1000000\0",
    );
    peer.send(close_cmd(Role::Control), 3, 0, &[]);
    peer.ack(Role::Stdout, 3, 256);

    let mut received = 0usize;
    while received < 256 {
        let frame = peer.recv();
        assert_eq!(frame.id, 3);
        match frame.cmd {
            c if c == write_cmd(Role::Stdout) => {
                assert!(frame.payload.len() <= MAX_WRITE);
                received += frame.payload.len();
                assert!(received <= 256);
            }
            c if is_ack(c) => {}
            other => panic!("unexpected frame {:#04x}", other),
        }
    }

    peer.send(CMD_CLOSE, 3, 0, &[]);
    loop {
        let frame = peer.recv();
        assert_eq!(frame.id, 3);
        match frame.cmd {
            CMD_CLOSE_ACK => break,
            c if is_ack(c) => {}
            other => panic!("unexpected frame after CLOSE {:#04x}", other),
        }
    }
}

fn backpressured_output(peer: &mut Peer) {
    peer.open(1);
    peer.send(
        write_cmd(Role::Control),
        1,
        0,
        b"/bin/sh\0-c\0yes | head -c 10000\0",
    );
    peer.send(close_cmd(Role::Control), 1, 0, &[]);

    let mut granted = 300usize;
    peer.ack(Role::Stdout, 1, 300);

    let mut received = 0usize;
    let mut closed_out = false;
    let mut closed_err = false;
    let mut exit_seen = false;
    while !(closed_out && closed_err && exit_seen) {
        let frame = peer.recv();
        assert_eq!(frame.id, 1);
        match frame.cmd {
            c if c == write_cmd(Role::Stdout) => {
                assert!(frame.payload.len() <= MAX_WRITE);
                received += frame.payload.len();
                // the daemon must never outrun the granted window
                assert!(received <= granted);
                if received < 10000 && granted - received < MAX_WRITE {
                    peer.ack(Role::Stdout, 1, 300);
                    granted += 300;
                }
            }
            c if c == close_cmd(Role::Stdout) => closed_out = true,
            c if c == close_cmd(Role::Stderr) => closed_err = true,
            CMD_EXIT_STATUS => exit_seen = true,
            c if is_ack(c) => {}
            other => panic!("unexpected frame {:#04x}", other),
        }
    }
    assert_eq!(received, 10000);
}

#[test]
fn protocol_session() {
    let (mut peer, daemon) = spawn_daemon();

    echo_round_trip(&mut peer);
    kill_mid_stream(&mut peer);
    close_with_pending_output(&mut peer);
    backpressured_output(&mut peer);

    peer.send(CMD_RESET, 0, 0, &[]);
    peer.expect_eof();
    assert_exit_code(daemon, 0);
}

#[test]
fn open_on_occupied_slot_is_fatal() {
    let (mut peer, daemon) = spawn_daemon();
    peer.open(4);
    peer.send(CMD_OPEN, 4, 0, &[]);
    peer.expect_eof();
    assert_exit_code(daemon, 1);
}

#[test]
fn connect_via_socket_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usbexecd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    match unsafe { nix::unistd::fork() }.unwrap() {
        ForkResult::Child => {
            drop(listener);
            let code = match Daemon::connect(&path).and_then(|mut d| d.run()) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            let (sock, _addr) = listener.accept().unwrap();
            let mut peer = Peer::new(sock);
            echo_round_trip(&mut peer);
            peer.send(CMD_RESET, 0, 0, &[]);
            peer.expect_eof();
            assert_exit_code(child, 0);
        }
    }
}
