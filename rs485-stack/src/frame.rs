//! RS-485 frame layout: `[slave_addr|function_code|sequence|packet|CRC16]`.
//! Grounded on `red_rs485_extension.c`'s receive union and
//! `frame_get_content_dump`.

use crate::crc::crc16;
use bridge_core::packet::Packet;

pub const HEADER_LENGTH: usize = 3;
pub const FOOTER_LENGTH: usize = 2;

/// Custom Modbus function code the master and slaves exchange TFP
/// packets under.
pub const FUNCTION_CODE: u8 = 100;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameError {
    TooShort,
    CrcMismatch,
}

/// A decoded frame: header fields plus the embedded TFP packet bytes
/// (still unparsed, since an empty poll frame carries no packet at all).
pub struct Frame {
    pub address: u8,
    pub function_code: u8,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds the wire bytes for `address`/`sequence` wrapping either a
    /// TFP packet (`Some`) or an empty poll/ack frame (`None`).
    pub fn encode(address: u8, sequence: u8, packet: Option<&Packet>) -> Vec<u8> {
        let mut body = Vec::with_capacity(HEADER_LENGTH + Packet::MAX_LEN + FOOTER_LENGTH);
        body.push(address);
        body.push(FUNCTION_CODE);
        body.push(sequence);

        if let Some(packet) = packet {
            body.extend_from_slice(packet.as_bytes());
        }

        let crc = crc16(&body);
        body.push((crc >> 8) as u8);
        body.push((crc & 0xff) as u8);

        body
    }

    /// Validates and splits a complete frame read off the wire.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_LENGTH + FOOTER_LENGTH {
            return Err(FrameError::TooShort);
        }

        let body = &bytes[..bytes.len() - FOOTER_LENGTH];
        let received_crc = ((bytes[bytes.len() - 2] as u16) << 8) | bytes[bytes.len() - 1] as u16;

        if crc16(body) != received_crc {
            return Err(FrameError::CrcMismatch);
        }

        Ok(Frame {
            address: body[0],
            function_code: body[1],
            sequence: body[2],
            payload: body[HEADER_LENGTH..].to_vec(),
        })
    }
}

trait PacketLen {
    const MAX_LEN: usize;
}

impl PacketLen for Packet {
    const MAX_LEN: usize = bridge_core::packet::MAX_PACKET_LENGTH;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::packet::PacketBuilder;

    #[test]
    fn test_encode_then_decode_round_trip_with_packet() {
        let packet = PacketBuilder::new(5, 2).payload(vec![9, 9, 9]).build().unwrap();
        let bytes = Frame::encode(7, 3, Some(&packet));

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.address, 7);
        assert_eq!(frame.function_code, FUNCTION_CODE);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.payload, packet.as_bytes());
    }

    #[test]
    fn test_encode_then_decode_empty_poll_frame() {
        let bytes = Frame::encode(1, 0, None);
        let frame = Frame::decode(&bytes).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_corrupted_frame() {
        let mut bytes = Frame::encode(1, 0, None);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert_eq!(Frame::decode(&bytes).unwrap_err(), FrameError::CrcMismatch);
    }

    #[test]
    fn test_decode_rejects_too_short_buffer() {
        assert_eq!(Frame::decode(&[1, 2]).unwrap_err(), FrameError::TooShort);
    }
}
