//! Drives `Master` across a poll/response cycle the way `bridged`'s
//! cleanup hook and read callback do, and checks that a corrupted reply
//! both retries correctly and persists its CRC error count to disk.

use bridge_core::packet::PacketBuilder;
use bridge_core::stack::StackId;
use rs485_stack::crc_store::CrcErrorCounter;
use rs485_stack::frame::Frame;
use rs485_stack::master::TRIES_DATA;
use rs485_stack::{Master, MasterEvent};
use support::logging;

#[test]
fn test_queued_request_round_trips_through_poll_and_response() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let counter = CrcErrorCounter::load(file.path()).unwrap();
    let mut master = Master::new(115200, &[9], counter, logging::discard());

    let request: StackId = 0;
    let outbound = PacketBuilder::new(9, 3).payload(vec![1, 2, 3]).build().unwrap();
    master.enqueue_request(request, outbound);

    let mut sent = Vec::new();
    master.poll_next_slave(|bytes| {
        sent = bytes.to_vec();
        Ok(())
    })
    .unwrap();
    assert!(!master.is_idle());

    let response_packet = PacketBuilder::new(9, 3).payload(vec![9, 9]).build().unwrap();
    let response_frame = Frame::encode(9, 1, Some(&response_packet));

    let mut wire = sent;
    wire.extend_from_slice(&response_frame);

    match master.on_bytes_received(&wire) {
        MasterEvent::Response { stack_id, packet } => {
            assert_eq!(stack_id, 0);
            assert_eq!(packet.payload(), &[9, 9]);
        }
        _ => panic!("expected a response, got a different event"),
    }
    assert!(master.is_idle());
}

#[test]
fn test_corrupted_response_increments_and_persists_crc_error_count() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let counter = CrcErrorCounter::load(file.path()).unwrap();
    let mut master = Master::new(115200, &[9], counter, logging::discard());

    let outbound = PacketBuilder::new(9, 3).payload(vec![1]).build().unwrap();
    master.enqueue_request(0, outbound);

    let mut sent = Vec::new();
    master.poll_next_slave(|bytes| {
        sent = bytes.to_vec();
        Ok(())
    })
    .unwrap();

    let response_packet = PacketBuilder::new(9, 3).payload(vec![1]).build().unwrap();
    let mut response_frame = Frame::encode(9, 1, Some(&response_packet));
    let last = response_frame.len() - 1;
    response_frame[last] ^= 0xff;

    let mut wire = sent;
    wire.extend_from_slice(&response_frame);

    let event = master.on_bytes_received(&wire);
    assert!(matches!(event, MasterEvent::Pending), "a recoverable CRC error retries instead of giving up immediately");
    assert_eq!(master.crc_error_count(), 1);

    master.flush_crc_error_count().unwrap();

    let reloaded = CrcErrorCounter::load(file.path()).unwrap();
    assert_eq!(reloaded.value(), 1);
}

#[test]
fn test_frame_is_dropped_once_retries_are_exhausted() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let counter = CrcErrorCounter::load(file.path()).unwrap();
    let mut master = Master::new(115200, &[9], counter, logging::discard());

    let outbound = PacketBuilder::new(9, 3).payload(vec![1]).build().unwrap();
    master.enqueue_request(0, outbound);

    master.poll_next_slave(|_| Ok(())).unwrap();

    let mut last_event = MasterEvent::Pending;
    for _ in 0..TRIES_DATA {
        last_event = master.on_timeout();
        if matches!(last_event, MasterEvent::Exhausted { .. }) {
            break;
        }
        master.poll_next_slave(|_| Ok(())).unwrap();
    }

    match last_event {
        MasterEvent::Exhausted { stack_id } => assert_eq!(stack_id, 0),
        _ => panic!("expected the frame to exhaust its retries"),
    }
}
