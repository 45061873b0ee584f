use crate::proto::Role;

/// Daemon-level failure.
///
/// The daemon serves a single trusted peer over one socket, so there is no
/// error frame on the wire: every variant below tears the process down after
/// being logged. Per-operation conditions (EAGAIN on a pipe, EOF on a child
/// stream) are handled in place and never surface here.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("system call failed in undesired fashion (error code {})", code)]
    Syscall { code: i32 },
    #[error("io error")]
    Io {
        #[from]
        cause: std::io::Error,
    },
    #[error("control socket closed by peer")]
    PeerGone,
    #[error("short write on control socket")]
    ShortWrite,
    #[error("OPEN for already occupied slot {}", id)]
    SlotBusy { id: u8 },
    #[error("command references empty slot {}", id)]
    NoSuchSlot { id: u8 },
    #[error("payload for closed {:?} stream of slot {}", role, id)]
    StreamClosed { id: u8, role: Role },
    #[error("peer overran its {:?} window on slot {} by {} bytes", role, id, excess)]
    CreditOverrun { id: u8, role: Role, excess: usize },
    #[error("peer sent a frame it may not send (command {:#04x}, slot {})", cmd, id)]
    UnexpectedFrame { cmd: u8, id: u8 },
    #[error("unknown command byte {:#04x}", cmd)]
    UnknownCommand { cmd: u8 },
    #[error("bad signal number {}", signo)]
    BadSignal { signo: u8 },
    #[error("unknown error")]
    Unknown,
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        if let Some(errno) = err.as_errno() {
            Error::Syscall { code: errno as i32 }
        } else {
            Error::Unknown
        }
    }
}
