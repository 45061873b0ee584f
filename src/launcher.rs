//! Child-side program launch.
//!
//! Runs in the freshly forked child after the parent's descriptors have been
//! shed. The control pipe carries the argument vector as NUL-delimited
//! strings, program name first; end of vector is the pipe's EOF.

use crate::fd::Fd;
use std::ffi::CString;
use std::io::ErrorKind;

/// Upper bound on the raw argument blob read from the control stream.
pub const ARG_BYTES_MAX: usize = 1023;

/// Upper bound on the number of argument strings.
pub const ARG_COUNT_MAX: usize = 255;

/// Reads the argument vector from the control pipe, rewires stdio onto the
/// conventional descriptors and replaces the process image. Never returns.
pub fn run(ctrl: Fd, stdin: Fd, stdout: Fd, stderr: Fd) -> ! {
    let argv = match read_argv(&ctrl) {
        Ok(argv) => argv,
        Err(msg) => die(&msg),
    };
    drop(ctrl);

    if nix::unistd::dup2(stdin.as_raw(), libc::STDIN_FILENO).is_err()
        || nix::unistd::dup2(stdout.as_raw(), libc::STDOUT_FILENO).is_err()
        || nix::unistd::dup2(stderr.as_raw(), libc::STDERR_FILENO).is_err()
    {
        die(&format!("dup2 failed: {}", errno::errno()));
    }
    drop(stdin);
    drop(stdout);
    drop(stderr);

    // only returns on failure
    let _ = nix::unistd::execvp(&argv[0], &argv);
    die(&format!(
        "cannot execute {:?}: {}",
        argv[0],
        errno::errno()
    ));
}

fn read_argv(ctrl: &Fd) -> Result<Vec<CString>, String> {
    let mut blob = [0u8; ARG_BYTES_MAX + 1];
    let mut len = 0;
    loop {
        if len == blob.len() {
            return Err(format!(
                "argument vector exceeds {} bytes",
                ARG_BYTES_MAX
            ));
        }
        match ctrl.read(&mut blob[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("cannot read argument vector: {}", e)),
        }
    }

    let mut parts: Vec<&[u8]> = blob[..len].split(|b| *b == 0).collect();
    if let Some(last) = parts.last() {
        if last.is_empty() {
            parts.pop();
        }
    }
    if parts.is_empty() {
        return Err("empty argument vector".to_string());
    }
    if parts.len() > ARG_COUNT_MAX {
        return Err(format!("more than {} arguments", ARG_COUNT_MAX));
    }
    parts
        .into_iter()
        .map(|part| CString::new(part.to_vec()).map_err(|e| e.to_string()))
        .collect()
}

fn die(msg: &str) -> ! {
    eprintln!("usbexecd child: {}", msg);
    unsafe { libc::_exit(127) }
}
