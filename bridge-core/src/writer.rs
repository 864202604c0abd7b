//! Buffered, backpressure-aware outgoing queue. Grounded on
//! `daemonlib/writer.c`'s backlog accounting and `neutronium::net::buffer`
//! for the `VecDeque`-based queue idiom.
//!
//! Each `Writer` owns a bounded FIFO of whole packets. When the backlog
//! would exceed `BACKLOG_LIMIT` packets, the oldest queued packet is
//! dropped to make room for the new one and `dropped` is incremented,
//! matching spec.md §4.4's drop-oldest policy.

use std::collections::VecDeque;
use std::io;

use crate::io::{IoStream, Status};

/// Maximum number of whole packets held in a writer's backlog before the
/// oldest is dropped to make room.
pub const BACKLOG_LIMIT: usize = 32768;

pub struct Writer {
    backlog: VecDeque<Vec<u8>>,
    /// Byte offset already flushed from the packet at the front of
    /// `backlog`; nonzero only mid-write, when a prior `write_nonblocking`
    /// call returned a short write.
    front_offset: usize,
    dropped: u64,
}

impl Writer {
    pub fn new() -> Writer {
        Writer {
            backlog: VecDeque::new(),
            front_offset: 0,
            dropped: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Appends a packet to the backlog, dropping the oldest queued packet
    /// first if the backlog is already at `BACKLOG_LIMIT`.
    pub fn enqueue(&mut self, packet: Vec<u8>) {
        if self.backlog.len() >= BACKLOG_LIMIT {
            self.backlog.pop_front();
            if self.front_offset != 0 {
                self.front_offset = 0;
            }
            self.dropped += 1;
        }

        self.backlog.push_back(packet);
    }

    /// Drains as much of the backlog as the stream accepts without
    /// blocking. Returns `Ok(true)` if the backlog is now fully flushed.
    pub fn flush(&mut self, io: &mut dyn IoStream) -> io::Result<bool> {
        while let Some(packet) = self.backlog.front() {
            let remaining = &packet[self.front_offset..];

            match io.write_nonblocking(remaining)? {
                Status::Progress(n) => {
                    self.front_offset += n;
                    if self.front_offset >= packet.len() {
                        self.backlog.pop_front();
                        self.front_offset = 0;
                    }
                }
                Status::WouldBlock => return Ok(false),
                Status::Eof => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed during write"));
                }
            }
        }

        Ok(true)
    }
}

impl Default for Writer {
    fn default() -> Writer {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, RawFd};

    struct FailStream;

    impl AsRawFd for FailStream {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl IoStream for FailStream {
        fn read_nonblocking(&mut self, _buf: &mut [u8]) -> io::Result<Status> {
            Ok(Status::WouldBlock)
        }

        fn write_nonblocking(&mut self, _buf: &[u8]) -> io::Result<Status> {
            Ok(Status::WouldBlock)
        }

        fn peer_description(&self) -> String {
            "fail".to_string()
        }
    }

    struct AcceptAllStream {
        received: Vec<u8>,
    }

    impl AsRawFd for AcceptAllStream {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl IoStream for AcceptAllStream {
        fn read_nonblocking(&mut self, _buf: &mut [u8]) -> io::Result<Status> {
            Ok(Status::WouldBlock)
        }

        fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status> {
            self.received.extend_from_slice(buf);
            Ok(Status::Progress(buf.len()))
        }

        fn peer_description(&self) -> String {
            "accept-all".to_string()
        }
    }

    #[test]
    fn test_flush_drains_whole_backlog() {
        let mut writer = Writer::new();
        writer.enqueue(vec![1, 2, 3]);
        writer.enqueue(vec![4, 5]);

        let mut io = AcceptAllStream { received: Vec::new() };
        assert!(writer.flush(&mut io).unwrap());
        assert!(writer.is_empty());
        assert_eq!(io.received, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_flush_reports_not_done_on_would_block() {
        let mut writer = Writer::new();
        writer.enqueue(vec![1, 2, 3]);

        let mut io = FailStream;
        assert!(!writer.flush(&mut io).unwrap());
        assert!(!writer.is_empty());
    }

    #[test]
    fn test_enqueue_drops_oldest_past_backlog_limit() {
        let mut writer = Writer::new();
        for i in 0..(BACKLOG_LIMIT + 5) {
            writer.enqueue(vec![i as u8]);
        }

        assert_eq!(writer.backlog.len(), BACKLOG_LIMIT);
        assert_eq!(writer.dropped_count(), 5);
        assert_eq!(writer.backlog.front().unwrap()[0], 5);
    }
}
