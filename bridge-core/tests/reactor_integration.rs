//! Exercises the reactor end to end over real descriptors (a connected
//! pair of unix sockets), rather than through the inline unit tests that
//! only ever see a closure's captured state.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use bridge_core::reactor::{Interest, Reactor, SourceType};
use support::logging;

#[test]
fn test_reactor_delivers_read_event_and_stops_on_demand() {
    let (mut writer_end, mut reader_end) = UnixStream::pair().unwrap();
    reader_end.set_nonblocking(true).unwrap();
    let reader_fd = reader_end.as_raw_fd();

    let mut reactor = Reactor::new(logging::discard()).unwrap();
    reactor.add_source(reader_fd, SourceType::Generic, "test-sock", Interest::READ).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_in_callback = received.clone();
    let stop_handle = reactor.stop_handle();

    reactor.set_read_callback(reader_fd, SourceType::Generic, move |_reactor| {
        let mut buf = [0u8; 16];
        if let Ok(n) = reader_end.read(&mut buf) {
            received_in_callback.borrow_mut().extend_from_slice(&buf[..n]);
        }
        stop_handle.stop();
    });

    writer_end.write_all(b"hello").unwrap();

    reactor.run(|_reactor| {}).unwrap();

    assert_eq!(&received.borrow()[..], b"hello");
}

#[test]
fn test_callback_can_remove_its_own_source_mid_dispatch() {
    let (mut writer_end, mut reader_end) = UnixStream::pair().unwrap();
    reader_end.set_nonblocking(true).unwrap();
    let reader_fd = reader_end.as_raw_fd();

    let mut reactor = Reactor::new(logging::discard()).unwrap();
    reactor.add_source(reader_fd, SourceType::Generic, "self-removing", Interest::READ).unwrap();

    let calls = Rc::new(RefCell::new(0));
    let calls_in_callback = calls.clone();
    let stop_handle = reactor.stop_handle();

    reactor.set_read_callback(reader_fd, SourceType::Generic, move |reactor| {
        *calls_in_callback.borrow_mut() += 1;

        let mut buf = [0u8; 16];
        let _ = reader_end.read(&mut buf);

        reactor.remove_source(reader_fd, SourceType::Generic);
        stop_handle.stop();
    });

    writer_end.write_all(b"x").unwrap();

    reactor.run(|_reactor| {}).unwrap();

    assert_eq!(*calls.borrow(), 1);
}
