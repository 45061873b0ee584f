//! Framing over the control socket.
//!
//! The socket is the single shared transport for every stream of every slot,
//! so frames must never interleave partially. Reads and writes inside one
//! frame therefore spin on EAGAIN until the frame is complete; the peer is
//! the sole source of socket data and frames are small, so the spin is
//! bounded.

use crate::{
    error::Error,
    proto::{ack_cmd, close_cmd, write_cmd, Header, Role, ACK_LEN, CMD_CLOSE_ACK, CMD_EXIT_STATUS, HEADER_LEN, MAX_WRITE},
};
use std::{
    io::{ErrorKind, Read, Write},
    os::unix::io::{AsRawFd, RawFd},
    os::unix::net::UnixStream,
};

/// Sink for frames travelling daemon-to-peer.
///
/// The flow-control machinery only ever appends whole frames, so it talks to
/// this trait instead of the socket; tests substitute a recording sink.
pub trait FrameSink {
    fn send_frame(&mut self, hdr: Header, payload: &[u8]) -> Result<(), Error>;

    /// Grants the peer `credit` more bytes of send window on a stream.
    fn send_ack(&mut self, id: u8, role: Role, credit: u32) -> Result<(), Error> {
        let hdr = Header::new(ack_cmd(role), id, 0, ACK_LEN as u8);
        self.send_frame(hdr, &credit.to_le_bytes())
    }

    /// Forwards stream payload to the peer. At most [`MAX_WRITE`] bytes.
    fn send_data(&mut self, id: u8, role: Role, payload: &[u8]) -> Result<(), Error> {
        debug_assert!(payload.len() <= MAX_WRITE);
        let hdr = Header::new(write_cmd(role), id, 0, payload.len() as u8);
        self.send_frame(hdr, payload)
    }

    /// Announces that one direction of one stream is closed for good.
    fn send_stream_close(&mut self, id: u8, role: Role) -> Result<(), Error> {
        self.send_frame(Header::new(close_cmd(role), id, 0, 0), &[])
    }

    fn send_exit_status(&mut self, id: u8, status: u8) -> Result<(), Error> {
        self.send_frame(Header::new(CMD_EXIT_STATUS, id, status, 0), &[])
    }

    fn send_close_ack(&mut self, id: u8) -> Result<(), Error> {
        self.send_frame(Header::new(CMD_CLOSE_ACK, id, 0, 0), &[])
    }
}

/// The daemon end of the control socket.
pub struct Connection {
    sock: UnixStream,
}

impl Connection {
    pub fn new(sock: UnixStream) -> Result<Connection, Error> {
        sock.set_nonblocking(true)?;
        Ok(Connection { sock })
    }

    /// Reads a complete 4-byte header.
    pub fn read_header(&mut self) -> Result<Header, Error> {
        let mut raw = [0u8; HEADER_LEN];
        self.read_full(&mut raw)?;
        Ok(Header::decode(raw))
    }

    /// Reads the `len`-byte payload of a WRITE frame into `buf`.
    pub fn read_payload<'a>(
        &mut self,
        buf: &'a mut [u8; MAX_WRITE],
        len: u8,
    ) -> Result<&'a [u8], Error> {
        let len = len as usize;
        self.read_full(&mut buf[..len])?;
        Ok(&buf[..len])
    }

    /// Reads the fixed-width little-endian credit increment of an ACK frame.
    pub fn read_credit(&mut self) -> Result<u32, Error> {
        let mut raw = [0u8; ACK_LEN];
        self.read_full(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            match self.sock.read(&mut buf[done..]) {
                Ok(0) => return Err(Error::PeerGone),
                Ok(n) => done += n,
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_full(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            match self.sock.write(&buf[done..]) {
                Ok(0) => return Err(Error::ShortWrite),
                Ok(n) => done += n,
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl FrameSink for Connection {
    fn send_frame(&mut self, hdr: Header, payload: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(payload.len(), hdr.len as usize);
        let mut frame = [0u8; HEADER_LEN + MAX_WRITE];
        frame[..HEADER_LEN].copy_from_slice(&hdr.encode());
        frame[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        self.write_full(&frame[..HEADER_LEN + payload.len()])
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
