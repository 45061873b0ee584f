/*!
 * This crate implements a process-execution daemon: up to 256 concurrently
 * running children are exposed over a single local stream socket, with the
 * control, stdin, stdout and stderr streams of every child multiplexed as
 * small framed messages under per-stream credit-based flow control.
 *
 * The whole daemon is one single-threaded readiness loop; see [`daemon::Daemon`].
 */

pub mod conn;
pub mod daemon;
pub mod error;
pub mod fd;
pub mod launcher;
pub mod pipebuf;
pub mod poll;
pub mod proto;
pub mod table;

pub use crate::{daemon::Daemon, error::Error};
