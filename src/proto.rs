//! Wire protocol: a fixed 4-byte header, optionally followed by a payload.
//!
//! Data-bearing commands encode the stream role in their low four bits, so
//! `WRITE_STDIN == CMD_WRITE_BASE | Role::Stdin as u8` and so on for ACK and
//! per-stream CLOSE.

/// Ring capacity of every stream buffer, and the initial window granted to
/// the peer for each to-child stream.
pub const RING_SIZE: usize = 4096;

/// Largest payload of a single WRITE frame (the length field is one byte).
pub const MAX_WRITE: usize = 255;

pub const HEADER_LEN: usize = 4;

/// ACK payload width: a little-endian u32 credit increment, independent of
/// the platform's native integer width.
pub const ACK_LEN: usize = 4;

/// Number of process slots; slot ids fit the one-byte `id` header field.
pub const MAX_SLOTS: usize = 256;

pub const CMD_RESET: u8 = 0x00;
pub const CMD_OPEN: u8 = 0x01;
pub const CMD_CLOSE: u8 = 0x02;
pub const CMD_KILL: u8 = 0x03;
pub const CMD_EXIT_STATUS: u8 = 0x05;
pub const CMD_CLOSE_ACK: u8 = 0x06;
pub const CMD_WRITE_BASE: u8 = 0x10;
pub const CMD_ACK_BASE: u8 = 0x20;
pub const CMD_CLOSE_STREAM_BASE: u8 = 0x30;

/// One of the four byte streams of a process slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Control = 0,
    Stdin = 1,
    Stdout = 2,
    Stderr = 3,
}

/// Transfer direction of a stream, fixed by its role.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// Bytes flow from the peer into the child (control, stdin).
    ToChild,
    /// Bytes flow from the child to the peer (stdout, stderr).
    FromChild,
}

impl Role {
    pub fn from_index(idx: u8) -> Option<Role> {
        match idx {
            0 => Some(Role::Control),
            1 => Some(Role::Stdin),
            2 => Some(Role::Stdout),
            3 => Some(Role::Stderr),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn direction(self) -> Direction {
        match self {
            Role::Control | Role::Stdin => Direction::ToChild,
            Role::Stdout | Role::Stderr => Direction::FromChild,
        }
    }
}

pub fn write_cmd(role: Role) -> u8 {
    CMD_WRITE_BASE | role.index()
}

pub fn ack_cmd(role: Role) -> u8 {
    CMD_ACK_BASE | role.index()
}

pub fn close_cmd(role: Role) -> u8 {
    CMD_CLOSE_STREAM_BASE | role.index()
}

/// Operation class of a per-stream command byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamOp {
    Write,
    Ack,
    Close,
}

/// Splits a per-stream command byte into its operation and role, or `None`
/// for bytes outside the three per-stream ranges.
pub fn classify_stream(cmd: u8) -> Option<(StreamOp, Role)> {
    let role = Role::from_index(cmd & 0x0f)?;
    let op = match cmd & 0xf0 {
        CMD_WRITE_BASE => StreamOp::Write,
        CMD_ACK_BASE => StreamOp::Ack,
        CMD_CLOSE_STREAM_BASE => StreamOp::Close,
        _ => return None,
    };
    Some((op, role))
}

/// The fixed frame header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub cmd: u8,
    pub id: u8,
    pub arg: u8,
    pub len: u8,
}

impl Header {
    pub fn new(cmd: u8, id: u8, arg: u8, len: u8) -> Header {
        Header { cmd, id, arg, len }
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        [self.cmd, self.id, self.arg, self.len]
    }

    pub fn decode(raw: [u8; HEADER_LEN]) -> Header {
        Header {
            cmd: raw[0],
            id: raw[1],
            arg: raw[2],
            len: raw[3],
        }
    }
}
