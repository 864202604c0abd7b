//! Self-pipe signal handling: the async-signal-unsafe work (logging,
//! stopping the reactor) happens on the event loop thread after a
//! single-byte write wakes it up, the one-writable-byte-per-signal
//! forwarding grounded on `daemonlib/signal.c`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward(signal_number: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    let byte = signal_number as u8;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

/// Installs handlers for SIGINT/SIGTERM/SIGHUP that forward the signal
/// number into `write_fd`. Safe to call once per process; `write_fd`
/// should be the write end of a pipe registered with the reactor.
pub fn install(write_fd: RawFd) {
    SIGNAL_WRITE_FD.store(write_fd, Ordering::Relaxed);

    unsafe {
        libc::signal(libc::SIGINT, forward as usize);
        libc::signal(libc::SIGTERM, forward as usize);
        libc::signal(libc::SIGHUP, forward as usize);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Unknown(u8),
}

impl From<u8> for Signal {
    fn from(byte: u8) -> Signal {
        match byte as i32 {
            libc::SIGINT => Signal::Interrupt,
            libc::SIGTERM => Signal::Terminate,
            libc::SIGHUP => Signal::Hangup,
            _ => Signal::Unknown(byte),
        }
    }
}
