//! A flock'ed, inode-verified PID file. Grounded on `daemonlib/pid_file.c`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

#[derive(Debug)]
pub enum AcquireError {
    /// Another process already holds the lock.
    AlreadyAcquired,
    Io(io::Error),
}

impl From<io::Error> for AcquireError {
    fn from(err: io::Error) -> Self {
        AcquireError::Io(err)
    }
}

/// A held PID file. Dropping it does not release the lock or unlink the
/// file by itself; call `release` explicitly, matching the C API's
/// separate acquire/release pair so callers can decide when to give it up
/// (typically only on clean shutdown, never on a crash).
pub struct PidFile {
    file: File,
    path: std::path::PathBuf,
}

impl PidFile {
    /// Opens (creating if necessary), `flock`s and writes the current
    /// process id into `path`. Retries the open/lock/verify loop if the
    /// file is replaced out from under us between `open` and `flock`,
    /// exactly like `pid_file_acquire`'s inode re-check.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<PidFile, AcquireError> {
        let path = path.as_ref().to_path_buf();

        loop {
            let file = OpenOptions::new().write(true).create(true).open(&path)?;

            let st1 = file.metadata()?;

            let lock_result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

            if lock_result < 0 {
                let err = io::Error::last_os_error();

                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(AcquireError::AlreadyAcquired);
                }

                return Err(AcquireError::Io(err));
            }

            // Re-stat by path; if it no longer matches the file we locked,
            // someone replaced it between open() and flock(), retry.
            match std::fs::metadata(&path) {
                Ok(st2) if st2.ino() == st1.ino() => {
                    let mut file = file;
                    file.set_len(0)?;
                    write!(file, "{}", std::process::id())?;
                    file.flush()?;

                    return Ok(PidFile { file, path });
                }
                _ => continue,
            }
        }
    }

    /// Releases the lock, unlinks the file and consumes the handle.
    pub fn release(self) -> io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
    }
}

trait MetadataExt {
    fn ino(&self) -> u64;
}

impl MetadataExt for std::fs::Metadata {
    fn ino(&self) -> u64 {
        use std::os::unix::fs::MetadataExt;
        MetadataExt::ino(self)
    }
}
