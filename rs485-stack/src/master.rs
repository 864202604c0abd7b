//! The half-duplex RS-485 master: round-robin polls every configured
//! slave, enforces the echo-then-response protocol and retries per the
//! frame's tries-left budget. Grounded on
//! `red_rs485_extension.c`'s `master_poll_slave`/`master_timeout_handler`
//! and the `RS485Slave`/`RS485ExtensionPacket` structures.

use std::collections::VecDeque;
use std::time::Duration;

use bridge_core::packet::Packet;
use bridge_core::stack::StackId;
use slog::Logger;

use crate::crc_store::CrcErrorCounter;
use crate::frame::{Frame, FrameError};
use support::logging;

/// Number of retries granted to a frame carrying an actual TFP packet.
pub const TRIES_DATA: u8 = 10;
/// Number of retries granted to an empty poll/ack frame.
pub const TRIES_EMPTY: u8 = 1;

/// Bytes used to size the per-frame timeout, matching `TIMEOUT_BYTES`.
const TIMEOUT_BYTES: u64 = 86;
/// Bits per serial byte (8 data + start + stop), used to turn a byte
/// count into a duration at a given baudrate.
const BITS_PER_BYTE: u64 = 10;
const FIXED_TIMEOUT_MICROS: u64 = 8000;

/// `2 * (86 bytes / baudrate) + 8ms`, expressed with bits-per-byte made
/// explicit instead of left as an implicit unit of `baudrate`.
pub fn frame_timeout(baudrate: u32) -> Duration {
    let micros_for_86_bytes = (TIMEOUT_BYTES * BITS_PER_BYTE * 1_000_000) / baudrate.max(1) as u64;
    Duration::from_micros(2 * micros_for_86_bytes + FIXED_TIMEOUT_MICROS)
}

struct QueuedFrame {
    packet: Option<Packet>,
    tries_left: u8,
}

struct Slave {
    address: u8,
    stack_id: StackId,
    sequence: u8,
    queue: VecDeque<QueuedFrame>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum MasterState {
    /// Waiting for the round-robin tick to pick the next slave.
    Idle,
    /// A frame was written to the wire; waiting to read back the
    /// half-duplex echo before the slave's real reply.
    AwaitingEcho,
    /// Echo matched; waiting for the slave's actual response.
    AwaitingResponse,
}

pub struct Master {
    baudrate: u32,
    slaves: Vec<Slave>,
    round_robin_cursor: usize,
    state: MasterState,
    current_sent_frame: Vec<u8>,
    current_slave_index: Option<usize>,
    current_tries_left: u8,
    crc_errors: CrcErrorCounter,
    log: Logger,
}

/// What the caller (the reactor glue in `bridged`) should do after
/// feeding the master newly read bytes or a timeout tick.
pub enum MasterEvent {
    /// Nothing ready yet.
    Pending,
    /// A TFP packet response came back from `stack_id`.
    Response { stack_id: StackId, packet: Packet },
    /// The current frame ran out of retries and was dropped.
    Exhausted { stack_id: StackId },
}

impl Master {
    pub fn new(baudrate: u32, slave_addresses: &[u8], crc_errors: CrcErrorCounter, log: Logger) -> Master {
        let slaves = slave_addresses
            .iter()
            .enumerate()
            .map(|(i, &address)| Slave {
                address,
                stack_id: i,
                sequence: 0,
                queue: VecDeque::new(),
            })
            .collect();

        Master {
            baudrate,
            slaves,
            round_robin_cursor: 0,
            state: MasterState::Idle,
            current_sent_frame: Vec::new(),
            current_slave_index: None,
            current_tries_left: 0,
            crc_errors,
            log,
        }
    }

    pub fn timeout(&self) -> Duration {
        frame_timeout(self.baudrate)
    }

    pub fn stack_ids(&self) -> Vec<StackId> {
        self.slaves.iter().map(|s| s.stack_id).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.state == MasterState::Idle
    }

    /// Enqueues an outgoing request for `stack_id`, if it names one of
    /// the configured slaves.
    pub fn enqueue_request(&mut self, stack_id: StackId, packet: Packet) {
        if let Some(slave) = self.slaves.iter_mut().find(|s| s.stack_id == stack_id) {
            slave.queue.push_back(QueuedFrame {
                packet: Some(packet),
                tries_left: TRIES_DATA,
            });
        }
    }

    /// Picks the next slave in round-robin order and writes its next
    /// frame (a queued data frame, or an empty poll frame if the queue is
    /// empty) to `write`. Only valid to call while `Idle`.
    pub fn poll_next_slave(&mut self, write: impl FnOnce(&[u8]) -> std::io::Result<()>) -> std::io::Result<()> {
        if self.slaves.is_empty() {
            return Ok(());
        }

        let index = self.round_robin_cursor % self.slaves.len();
        self.round_robin_cursor = (index + 1) % self.slaves.len();

        let slave = &mut self.slaves[index];
        let (packet, tries_left) = match slave.queue.front() {
            Some(frame) => (frame.packet.clone(), frame.tries_left),
            None => (None, TRIES_EMPTY),
        };

        slave.sequence = slave.sequence.wrapping_add(1).max(1);
        let frame_bytes = Frame::encode(slave.address, slave.sequence, packet.as_ref());

        write(&frame_bytes)?;

        self.current_sent_frame = frame_bytes;
        self.current_slave_index = Some(index);
        self.current_tries_left = tries_left;
        self.state = MasterState::AwaitingEcho;

        Ok(())
    }

    /// Feeds bytes read back off the wire. The first `current_sent_frame
    /// .len()` bytes are expected to be the half-duplex echo of what was
    /// just written; anything past that is the slave's actual reply.
    pub fn on_bytes_received(&mut self, data: &[u8]) -> MasterEvent {
        match self.state {
            MasterState::AwaitingEcho => {
                if data.len() < self.current_sent_frame.len() {
                    return MasterEvent::Pending;
                }

                if data[..self.current_sent_frame.len()] != self.current_sent_frame[..] {
                    logging::warn!(self.log, "RS-485 echo mismatch, treating as line error");
                    return self.retry_or_exhaust();
                }

                self.state = MasterState::AwaitingResponse;

                let rest = &data[self.current_sent_frame.len()..];
                if rest.is_empty() {
                    MasterEvent::Pending
                } else {
                    self.on_bytes_received(rest)
                }
            }
            MasterState::AwaitingResponse => match Frame::decode(data) {
                Ok(frame) if frame.payload.is_empty() => {
                    self.state = MasterState::Idle;
                    MasterEvent::Pending
                }
                Ok(frame) => match Packet::parse(frame.payload) {
                    Ok(packet) => {
                        self.state = MasterState::Idle;
                        let stack_id = self.current_slave_index.and_then(|i| self.slaves.get(i)).map(|s| s.stack_id);
                        self.pop_current_frame();
                        match stack_id {
                            Some(stack_id) => MasterEvent::Response { stack_id, packet },
                            None => MasterEvent::Pending,
                        }
                    }
                    Err(_) => self.retry_or_exhaust(),
                },
                Err(FrameError::CrcMismatch) => {
                    self.crc_errors.increment();
                    self.retry_or_exhaust()
                }
                Err(FrameError::TooShort) => MasterEvent::Pending,
            },
            MasterState::Idle => MasterEvent::Pending,
        }
    }

    /// Called when the current frame's timeout elapses with no (or a
    /// malformed) reply.
    pub fn on_timeout(&mut self) -> MasterEvent {
        if self.state == MasterState::Idle {
            return MasterEvent::Pending;
        }

        self.retry_or_exhaust()
    }

    fn retry_or_exhaust(&mut self) -> MasterEvent {
        self.state = MasterState::Idle;

        if self.current_tries_left <= 1 {
            let stack_id = self.current_slave_index.and_then(|i| self.slaves.get(i)).map(|s| s.stack_id);
            self.pop_current_frame();
            return match stack_id {
                Some(stack_id) => MasterEvent::Exhausted { stack_id },
                None => MasterEvent::Pending,
            };
        }

        if let Some(index) = self.current_slave_index {
            if let Some(frame) = self.slaves[index].queue.front_mut() {
                frame.tries_left = frame.tries_left.saturating_sub(1);
            }
        }

        MasterEvent::Pending
    }

    fn pop_current_frame(&mut self) {
        if let Some(index) = self.current_slave_index {
            self.slaves[index].queue.pop_front();
        }
        self.current_slave_index = None;
    }

    pub fn crc_error_count(&self) -> u64 {
        self.crc_errors.value()
    }

    pub fn flush_crc_error_count(&self) -> std::io::Result<()> {
        self.crc_errors.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::packet::PacketBuilder;
    use support::logging::discard;

    fn counter() -> CrcErrorCounter {
        let file = tempfile::NamedTempFile::new().unwrap();
        CrcErrorCounter::load(file.path()).unwrap()
    }

    #[test]
    fn test_frame_timeout_scales_inversely_with_baudrate() {
        assert!(frame_timeout(9600) > frame_timeout(115200));
    }

    #[test]
    fn test_round_robin_cycles_through_slaves() {
        let mut master = Master::new(115200, &[1, 2, 3], counter(), discard());

        let mut seen = Vec::new();
        for _ in 0..3 {
            master.poll_next_slave(|bytes| {
                seen.push(bytes[0]);
                Ok(())
            })
            .unwrap();
            master.state = MasterState::Idle;
        }

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_round_trip_delivers_response() {
        let mut master = Master::new(115200, &[5], counter(), discard());

        let mut sent = Vec::new();
        master.poll_next_slave(|bytes| {
            sent = bytes.to_vec();
            Ok(())
        })
        .unwrap();

        let response_packet = PacketBuilder::new(5, 1).payload(vec![7, 7]).build().unwrap();
        let response_frame = Frame::encode(5, 1, Some(&response_packet));

        let mut wire = sent.clone();
        wire.extend_from_slice(&response_frame);

        match master.on_bytes_received(&wire) {
            MasterEvent::Response { stack_id, packet } => {
                assert_eq!(stack_id, 0);
                assert_eq!(packet.payload(), &[7, 7]);
            }
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn test_exhausted_after_tries_run_out() {
        let mut master = Master::new(115200, &[5], counter(), discard());

        for _ in 0..TRIES_EMPTY {
            master.poll_next_slave(|_| Ok(())).unwrap();
            match master.on_timeout() {
                MasterEvent::Exhausted { stack_id } => assert_eq!(stack_id, 0),
                other => {
                    assert!(matches!(other, MasterEvent::Pending));
                    master.state = MasterState::AwaitingResponse;
                    let _ = master.on_timeout();
                }
            }
        }
    }
}
