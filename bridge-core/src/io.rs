//! Non-blocking I/O abstraction over the socket and file-like descriptors
//! the reactor can multiplex. Grounded on `neutronium::net::endpoint` for
//! the trait shape, generalized to the transports spec.md §3 lists:
//! plain TCP, WebSocket-framed TCP, a named pipe/file, and a serial
//! char-device.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

/// Outcome of a single non-blocking read or write attempt.
#[derive(Debug)]
pub enum Status {
    /// `n` bytes were transferred.
    Progress(usize),
    /// The call would have blocked; nothing was transferred.
    WouldBlock,
    /// A zero-byte read: the peer closed its end.
    Eof,
}

/// A duplex, non-blocking byte stream. Each transport variant wraps the
/// actual descriptor and implements the same read/write/status contract,
/// so `Client` and `Channel` never need to know which kind they're
/// holding.
pub trait IoStream: AsRawFd {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Status>;
    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status>;

    /// Human-readable description used in log lines, mirroring the C
    /// client's `peer_name`.
    fn peer_description(&self) -> String;
}

fn classify_read(result: io::Result<usize>) -> io::Result<Status> {
    match result {
        Ok(0) => Ok(Status::Eof),
        Ok(n) => Ok(Status::Progress(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Status::WouldBlock),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Status::WouldBlock),
        Err(err) => Err(err),
    }
}

fn classify_write(result: io::Result<usize>) -> io::Result<Status> {
    match result {
        Ok(n) => Ok(Status::Progress(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Status::WouldBlock),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Status::WouldBlock),
        Err(err) => Err(err),
    }
}

/// A plain TCP connection, optionally framed as a WebSocket byte stream
/// (spec.md §3's browser transport). Framing is a thin pass-through here:
/// the higher-level `client` module drives the handshake and frame
/// unwrapping; this type just ships bytes.
pub struct TcpIo {
    stream: TcpStream,
    peer: String,
}

impl TcpIo {
    pub fn new(stream: TcpStream) -> io::Result<TcpIo> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());

        Ok(TcpIo { stream, peer })
    }
}

impl AsRawFd for TcpIo {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl IoStream for TcpIo {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Status> {
        classify_read(self.stream.read(buf))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status> {
        classify_write(self.stream.write(buf))
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}

/// A unidirectional or bidirectional pipe between two reactor-owned
/// endpoints in the same process, used for the zombie-list wakeup and
/// similar internal plumbing. Grounded on `neutronium`'s internal pipe
/// channel.
pub struct PipeIo {
    fd: RawFd,
    peer: String,
}

impl PipeIo {
    /// Takes ownership of an already-open, already non-blocking fd.
    pub unsafe fn from_raw_fd(fd: RawFd, peer: impl Into<String>) -> PipeIo {
        PipeIo { fd, peer: peer.into() }
    }
}

impl AsRawFd for PipeIo {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IoStream for PipeIo {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Status> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                return Ok(Status::WouldBlock);
            }
            return Err(err);
        }
        classify_read(Ok(n as usize))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                return Ok(Status::WouldBlock);
            }
            return Err(err);
        }
        classify_write(Ok(n as usize))
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }
}

impl Drop for PipeIo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A serial character device (RS-485), opened and configured by
/// `rs485-stack`; exposed here only through the shared `IoStream`
/// contract so the reactor's read/write dispatch stays transport-agnostic.
pub struct CharDeviceIo {
    fd: RawFd,
    path: String,
}

impl CharDeviceIo {
    pub unsafe fn from_raw_fd(fd: RawFd, path: impl Into<String>) -> CharDeviceIo {
        CharDeviceIo { fd, path: path.into() }
    }
}

impl AsRawFd for CharDeviceIo {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IoStream for CharDeviceIo {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Status> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                return Ok(Status::WouldBlock);
            }
            return Err(err);
        }
        // A zero-length read on a char device commonly just means "no
        // bytes queued right now", not a hangup the way it does on a
        // socket. Treat it the same as WouldBlock.
        if n == 0 {
            return Ok(Status::WouldBlock);
        }
        Ok(Status::Progress(n as usize))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                return Ok(Status::WouldBlock);
            }
            return Err(err);
        }
        classify_write(Ok(n as usize))
    }

    fn peer_description(&self) -> String {
        self.path.clone()
    }
}

impl Drop for CharDeviceIo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_io_reports_peer_description() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let io = TcpIo::new(client).unwrap();
        assert!(io.peer_description().contains("127.0.0.1"));
    }

    #[test]
    fn test_tcp_io_would_block_when_no_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut io = TcpIo::new(client).unwrap();

        let mut buf = [0u8; 16];
        match io.read_nonblocking(&mut buf).unwrap() {
            Status::WouldBlock => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
    }
}
