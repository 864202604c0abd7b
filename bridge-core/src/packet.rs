//! Wire packet format: an 8-byte header plus up to 72 bytes of payload.
//! Grounded on `daemonlib/packet.h` and `packet.c`'s bit-packing of the
//! sequence number / options byte and the error code / future-use byte.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

pub const HEADER_LENGTH: usize = 8;
pub const MAX_PACKET_LENGTH: usize = 80;
pub const MAX_PAYLOAD_LENGTH: usize = MAX_PACKET_LENGTH - HEADER_LENGTH;
pub const MIN_PACKET_LENGTH: usize = HEADER_LENGTH;

/// Function id reserved for the daemon itself (uid 1) rather than any
/// attached peripheral, used by the authentication handshake.
pub const FUNCTION_GET_AUTH_NONCE: u8 = 1;
pub const FUNCTION_AUTHENTICATE: u8 = 2;

/// `error_code` value synthesized for a request nothing can route: an
/// unknown uid with no stack to dispatch to, or an unrecognized daemon
/// function (spec.md §4.5/§4.6). Carried over from `packet.h`'s
/// `PACKET_E_FUNCTION_NOT_SUPPORTED`.
pub const FUNCTION_NOT_SUPPORTED: u8 = 2;

/// Function id clients send as a disconnect probe; daemon drops it
/// silently instead of routing it anywhere (spec.md §4.3).
pub const FUNCTION_DISCONNECT_PROBE: u8 = 128;

/// Reserved function ids for stack/device enumeration, carried over from
/// `daemonlib/packet.h` (spec.md §6 names `CALLBACK_ENUMERATE` but not the
/// full family; the other three are supplemented here since they share the
/// same payload layout and a stack adapter needs all of them).
pub const FUNCTION_STACK_ENUMERATE: u8 = 252;
pub const FUNCTION_CALLBACK_ENUMERATE: u8 = 253;
pub const FUNCTION_ENUMERATE: u8 = 254;
pub const FUNCTION_GET_IDENTITY: u8 = 255;

pub const ENUMERATION_TYPE_AVAILABLE: u8 = 0;
pub const ENUMERATION_TYPE_CONNECTED: u8 = 1;
pub const ENUMERATION_TYPE_DISCONNECTED: u8 = 2;

const ENUMERATE_UID_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketError {
    TooShort,
    TooLong,
    LengthOutOfRange(u8),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::TooShort => write!(f, "packet shorter than the header"),
            PacketError::TooLong => write!(f, "packet longer than the maximum packet length"),
            PacketError::LengthOutOfRange(len) => write!(f, "packet length {} outside [8, 80]", len),
        }
    }
}

impl std::error::Error for PacketError {}

/// A parsed header view over an owned byte buffer. The payload bytes
/// remain inline in `bytes`; accessors slice into it rather than
/// copying, the same way the C union overlays a header struct on a flat
/// buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Validates and wraps a fully received packet. `bytes.len()` must
    /// equal the `length` field in the header.
    pub fn parse(bytes: Vec<u8>) -> Result<Packet, PacketError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(PacketError::TooShort);
        }
        if bytes.len() > MAX_PACKET_LENGTH {
            return Err(PacketError::TooLong);
        }

        let length = bytes[4];
        if (length as usize) < MIN_PACKET_LENGTH || (length as usize) > MAX_PACKET_LENGTH {
            return Err(PacketError::LengthOutOfRange(length));
        }
        if length as usize != bytes.len() {
            return Err(PacketError::LengthOutOfRange(length));
        }

        Ok(Packet { bytes })
    }

    pub fn uid(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[0..4])
    }

    pub fn length(&self) -> u8 {
        self.bytes[4]
    }

    pub fn function_id(&self) -> u8 {
        self.bytes[5]
    }

    /// Bits 0-3: sequence number (0 for callbacks/broadcasts); bit 3
    /// doubles as "response expected" in request packets per
    /// `packet.h`'s `PacketHeader` bitfield layout; bits 4-5: response
    /// expected flag family; bit 7: authentication flag (reserved here).
    pub fn sequence_number(&self) -> u8 {
        (self.bytes[6] >> 4) & 0x0f
    }

    pub fn response_expected(&self) -> bool {
        (self.bytes[6] & 0x08) != 0
    }

    pub fn error_code(&self) -> u8 {
        (self.bytes[7] >> 6) & 0x03
    }

    pub fn is_response(&self) -> bool {
        // A response never carries the response-expected bit; it instead
        // identifies itself purely by matching sequence number against an
        // outstanding request. The routing core distinguishes the two by
        // context (which list it arrived via), so this helper is only a
        // convenience for logging.
        self.sequence_number() != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LENGTH..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Hex dump of the raw bytes, grounded on `packet_get_dump`; used in
    /// trace-level log lines when a packet fails to route anywhere.
    pub fn dump(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
    }

    /// A short string used in log lines, grounded on `packet_get_*_signature`.
    pub fn signature(&self) -> String {
        format!(
            "U: {}, L: {}, F: {}, S: {}, R: {}, E: {}",
            self.uid(),
            self.length(),
            self.function_id(),
            self.sequence_number(),
            self.response_expected() as u8,
            self.error_code()
        )
    }
}

/// Builds a header (and optionally payload) for an outgoing packet.
pub struct PacketBuilder {
    uid: u32,
    function_id: u8,
    sequence_number: u8,
    response_expected: bool,
    error_code: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(uid: u32, function_id: u8) -> PacketBuilder {
        PacketBuilder {
            uid,
            function_id,
            sequence_number: 0,
            response_expected: false,
            error_code: 0,
            payload: Vec::new(),
        }
    }

    pub fn sequence_number(mut self, n: u8) -> Self {
        self.sequence_number = n & 0x0f;
        self
    }

    pub fn response_expected(mut self, flag: bool) -> Self {
        self.response_expected = flag;
        self
    }

    pub fn error_code(mut self, code: u8) -> Self {
        self.error_code = code & 0x03;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Result<Packet, PacketError> {
        if self.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(PacketError::TooLong);
        }

        let length = (HEADER_LENGTH + self.payload.len()) as u8;
        let mut bytes = vec![0u8; length as usize];

        LittleEndian::write_u32(&mut bytes[0..4], self.uid);
        bytes[4] = length;
        bytes[5] = self.function_id;
        bytes[6] = (self.sequence_number << 4) | if self.response_expected { 0x08 } else { 0 };
        bytes[7] = self.error_code << 6;
        bytes[HEADER_LENGTH..].copy_from_slice(&self.payload);

        Ok(Packet { bytes })
    }
}

/// Typed view over a `CALLBACK_ENUMERATE` payload: which device just
/// showed up (or left), what it's plugged into, and its version info.
/// Grounded on `daemonlib/packet.h`'s `EnumerateCallback` struct; `uid` and
/// `connected_uid` are carried as plain ASCII here rather than base58,
/// since nothing in this crate needs the base58 alphabet beyond logging.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EnumerateCallback {
    pub uid: String,
    pub connected_uid: String,
    pub position: u8,
    pub hardware_version: (u8, u8, u8),
    pub firmware_version: (u8, u8, u8),
    pub device_identifier: u16,
    pub enumeration_type: u8,
}

impl EnumerateCallback {
    pub fn build(&self) -> Result<Packet, PacketError> {
        let mut payload = Vec::with_capacity(26);
        payload.extend_from_slice(&pad_ascii(&self.uid, ENUMERATE_UID_LENGTH));
        payload.extend_from_slice(&pad_ascii(&self.connected_uid, ENUMERATE_UID_LENGTH));
        payload.push(self.position);
        payload.extend_from_slice(&[self.hardware_version.0, self.hardware_version.1, self.hardware_version.2]);
        payload.extend_from_slice(&[self.firmware_version.0, self.firmware_version.1, self.firmware_version.2]);
        let mut device_identifier = [0u8; 2];
        LittleEndian::write_u16(&mut device_identifier, self.device_identifier);
        payload.extend_from_slice(&device_identifier);
        payload.push(self.enumeration_type);

        PacketBuilder::new(0, FUNCTION_CALLBACK_ENUMERATE).payload(payload).build()
    }

    pub fn parse(packet: &Packet) -> Result<EnumerateCallback, PacketError> {
        let payload = packet.payload();
        if payload.len() < 26 {
            return Err(PacketError::TooShort);
        }

        Ok(EnumerateCallback {
            uid: unpad_ascii(&payload[0..8]),
            connected_uid: unpad_ascii(&payload[8..16]),
            position: payload[16],
            hardware_version: (payload[17], payload[18], payload[19]),
            firmware_version: (payload[20], payload[21], payload[22]),
            device_identifier: LittleEndian::read_u16(&payload[23..25]),
            enumeration_type: payload[25],
        })
    }
}

fn pad_ascii(value: &str, width: usize) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.truncate(width);
    bytes.resize(width, 0);
    bytes
}

fn unpad_ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Incrementally accumulates bytes read off the wire into whole packets,
/// one client/connection at a time. Bound to a single packet of slack so
/// a peer cannot force unbounded buffering (spec.md §4.3).
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler { buf: Vec::with_capacity(MAX_PACKET_LENGTH) }
    }

    /// Feeds newly read bytes in; returns every whole packet that could
    /// be split off. On a malformed length byte the remaining buffer is
    /// dropped and `PacketError` bubbles up so the caller can disconnect
    /// the peer.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, PacketError> {
        self.buf.extend_from_slice(data);

        let mut packets = Vec::new();

        loop {
            if self.buf.len() < HEADER_LENGTH {
                break;
            }

            let length = self.buf[4] as usize;
            if length < MIN_PACKET_LENGTH || length > MAX_PACKET_LENGTH {
                self.buf.clear();
                return Err(PacketError::LengthOutOfRange(self.buf.get(4).copied().unwrap_or(0)));
            }

            if self.buf.len() < length {
                break;
            }

            let packet_bytes = self.buf.drain(..length).collect::<Vec<u8>>();
            packets.push(Packet::parse(packet_bytes)?);
        }

        Ok(packets)
    }
}

impl Default for FrameAssembler {
    fn default() -> FrameAssembler {
        FrameAssembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_parse_round_trip() {
        let packet = PacketBuilder::new(42, 7)
            .sequence_number(3)
            .response_expected(true)
            .payload(vec![1, 2, 3])
            .build()
            .unwrap();

        let parsed = Packet::parse(packet.into_bytes()).unwrap();
        assert_eq!(parsed.uid(), 42);
        assert_eq!(parsed.function_id(), 7);
        assert_eq!(parsed.sequence_number(), 3);
        assert!(parsed.response_expected());
        assert_eq!(parsed.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        assert_eq!(Packet::parse(vec![0; 4]).unwrap_err(), PacketError::TooShort);
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut bytes = vec![0u8; 8];
        bytes[4] = 10;
        assert!(Packet::parse(bytes).is_err());
    }

    #[test]
    fn test_frame_assembler_splits_two_back_to_back_packets() {
        let first = PacketBuilder::new(1, 1).build().unwrap().into_bytes();
        let second = PacketBuilder::new(2, 2).payload(vec![9, 9]).build().unwrap().into_bytes();

        let mut combined = first.clone();
        combined.extend_from_slice(&second);

        let mut assembler = FrameAssembler::new();
        let packets = assembler.feed(&combined).unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].uid(), 1);
        assert_eq!(packets[1].uid(), 2);
    }

    #[test]
    fn test_enumerate_callback_round_trips() {
        let callback = EnumerateCallback {
            uid: "abc123".to_string(),
            connected_uid: "".to_string(),
            position: b'a',
            hardware_version: (1, 0, 0),
            firmware_version: (2, 1, 3),
            device_identifier: 13,
            enumeration_type: ENUMERATION_TYPE_CONNECTED,
        };

        let packet = callback.build().unwrap();
        let parsed = EnumerateCallback::parse(&packet).unwrap();

        assert_eq!(parsed, callback);
        assert_eq!(packet.function_id(), FUNCTION_CALLBACK_ENUMERATE);
    }

    #[test]
    fn test_frame_assembler_holds_partial_packet() {
        let full = PacketBuilder::new(5, 5).payload(vec![1, 2, 3, 4]).build().unwrap().into_bytes();

        let mut assembler = FrameAssembler::new();
        let packets = assembler.feed(&full[..5]).unwrap();
        assert!(packets.is_empty());

        let packets = assembler.feed(&full[5..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].uid(), 5);
    }
}
