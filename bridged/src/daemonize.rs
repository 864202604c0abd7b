//! Double-fork daemonization. Grounded on `daemonlib/daemon.c`'s
//! `daemon_start`: first fork detaches from the controlling terminal,
//! `setsid` starts a new session, the second fork drops session
//! leadership so the daemon can never reacquire a controlling tty.

use std::io;
use std::os::unix::io::RawFd;

/// Forks twice and redirects stdin/stdout/stderr to `/dev/null`,
/// returning only in the final grandchild process. The parent and the
/// intermediate child both `exit` directly, matching the original's
/// status-pipe handoff simplified to a direct exit since this port has
/// no log-file-open step to gate on.
pub fn daemonize() -> io::Result<()> {
    match unsafe { libc::fork() } {
        pid if pid < 0 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        libc::umask(0);
    }

    match unsafe { libc::fork() } {
        pid if pid < 0 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    redirect_standard_fds()
}

fn redirect_standard_fds() -> io::Result<()> {
    let dev_null = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR) };
    if dev_null < 0 {
        return Err(io::Error::last_os_error());
    }

    for target in &[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(dev_null, *target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if dev_null > libc::STDERR_FILENO {
        unsafe {
            libc::close(dev_null as RawFd);
        }
    }

    Ok(())
}
