//! A connected network client: framing, the authentication handshake and
//! the outgoing backlog. Grounded on `brickd/client.c`'s state machine
//! and `neutronium::net::channel` for the mio-driven read/write idiom.

use slog::Logger;
use std::os::unix::io::RawFd;

use crate::auth;
use crate::io::{IoStream, Status};
use crate::packet::{
    FrameAssembler, Packet, PacketBuilder, PacketError, FUNCTION_AUTHENTICATE, FUNCTION_DISCONNECT_PROBE,
    FUNCTION_GET_AUTH_NONCE, FUNCTION_NOT_SUPPORTED,
};
use crate::writer::Writer;
use support::logging;

/// Daemon's own pseudo-uid, the target of the auth handshake packets.
pub const DAEMON_UID: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthState {
    /// No `authentication.secret` configured: every packet is accepted
    /// immediately, matching the handshake being a no-op.
    Disabled,
    /// Secret configured, nonce not yet requested.
    Enabled,
    /// `GET_AUTH_NONCE` answered; waiting for `AUTHENTICATE`.
    NonceSent { server_nonce: [u8; auth::NONCE_LENGTH] },
    /// Handshake complete, ordinary packets are now routed.
    Done,
}

pub type ClientId = usize;

pub struct Client {
    pub id: ClientId,
    pub fd: RawFd,
    auth_state: AuthState,
    secret: Option<Vec<u8>>,
    assembler: FrameAssembler,
    writer: Writer,
    peer: String,
    disconnected: bool,
}

/// Outcome of feeding newly read bytes into a client: packets that should
/// be routed into the hardware stacks, plus whether the client should now
/// be torn down.
pub struct ReadOutcome {
    pub routable: Vec<Packet>,
    pub disconnect: bool,
}

impl Client {
    pub fn new(id: ClientId, fd: RawFd, peer: String, secret: Option<Vec<u8>>) -> Client {
        let auth_state = if secret.is_some() { AuthState::Enabled } else { AuthState::Disabled };

        Client {
            id,
            fd,
            auth_state,
            secret,
            assembler: FrameAssembler::new(),
            writer: Writer::new(),
            peer,
            disconnected: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth_state, AuthState::Disabled | AuthState::Done)
    }

    pub fn peer_description(&self) -> &str {
        &self.peer
    }

    pub fn dropped_count(&self) -> u64 {
        self.writer.dropped_count()
    }

    /// Queues a packet for delivery to this client, subject to the
    /// writer's bounded backlog and drop-oldest policy.
    pub fn enqueue(&mut self, packet: Packet) {
        self.writer.enqueue(packet.into_bytes());
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writer.is_empty()
    }

    pub fn flush(&mut self, io: &mut dyn IoStream) -> std::io::Result<bool> {
        self.writer.flush(io)
    }

    /// Reads as much as is available without blocking, reassembles whole
    /// packets, and handles (or strips out) anything belonging to the
    /// authentication handshake before handing the rest back to the
    /// caller for routing.
    pub fn on_readable(&mut self, io: &mut dyn IoStream, log: &Logger) -> ReadOutcome {
        let mut buf = [0u8; 4096];
        let mut routable = Vec::new();

        loop {
            match io.read_nonblocking(&mut buf) {
                Ok(Status::Progress(n)) => {
                    let packets = match self.assembler.feed(&buf[..n]) {
                        Ok(packets) => packets,
                        Err(err) => {
                            logging::warn!(log, "dropping client after malformed packet"; "peer" => &self.peer, "error" => %err);
                            return ReadOutcome { routable, disconnect: true };
                        }
                    };

                    for packet in packets {
                        if let Some(outcome) = self.handle_packet(packet) {
                            routable.push(outcome);
                        }
                    }
                }
                Ok(Status::WouldBlock) => break,
                Ok(Status::Eof) => {
                    logging::debug!(log, "client disconnected"; "peer" => &self.peer);
                    return ReadOutcome { routable, disconnect: true };
                }
                Err(err) => {
                    logging::warn!(log, "read error, disconnecting client"; "peer" => &self.peer, "error" => %err);
                    return ReadOutcome { routable, disconnect: true };
                }
            }
        }

        ReadOutcome { routable, disconnect: self.disconnected }
    }

    /// Intercepts handshake packets and the disconnect probe; everything
    /// else is handed back to the caller to route, but only once
    /// authenticated.
    fn handle_packet(&mut self, packet: Packet) -> Option<Packet> {
        if packet.function_id() == FUNCTION_DISCONNECT_PROBE {
            return None;
        }

        if packet.uid() == DAEMON_UID {
            match packet.function_id() {
                FUNCTION_GET_AUTH_NONCE => {
                    self.handle_get_auth_nonce(&packet);
                    return None;
                }
                FUNCTION_AUTHENTICATE => {
                    self.handle_authenticate(&packet);
                    return None;
                }
                _ => {
                    if packet.response_expected() {
                        self.enqueue_not_supported(&packet);
                    }
                    return None;
                }
            }
        }

        if !self.is_authenticated() {
            self.disconnected = true;
            return None;
        }

        Some(packet)
    }

    fn handle_get_auth_nonce(&mut self, request: &Packet) {
        if !request.payload().is_empty() {
            self.disconnected = true;
            return;
        }

        // A redundant request in state Done resets the handshake instead
        // of being a no-op: it drops back to Enabled and is processed as
        // if this were the first nonce request.
        if matches!(self.auth_state, AuthState::Done) {
            self.auth_state = AuthState::Enabled;
        }

        let server_nonce = auth::generate_nonce();

        let response = match PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE)
            .sequence_number(request.sequence_number())
            .payload(server_nonce.to_vec())
            .build()
        {
            Ok(packet) => packet,
            Err(_) => return,
        };

        if matches!(self.auth_state, AuthState::Enabled) {
            self.auth_state = AuthState::NonceSent { server_nonce };
        }

        self.enqueue(response);
    }

    fn handle_authenticate(&mut self, request: &Packet) {
        let payload = request.payload();
        if payload.len() != auth::NONCE_LENGTH + auth::DIGEST_LENGTH {
            self.disconnected = true;
            return;
        }

        let mut client_nonce = [0u8; auth::NONCE_LENGTH];
        client_nonce.copy_from_slice(&payload[..auth::NONCE_LENGTH]);
        let digest = &payload[auth::NONCE_LENGTH..auth::NONCE_LENGTH + auth::DIGEST_LENGTH];

        let (server_nonce, secret) = match (self.auth_state, &self.secret) {
            (AuthState::NonceSent { server_nonce }, Some(secret)) => (server_nonce, secret.clone()),
            _ => {
                self.disconnected = true;
                return;
            }
        };

        if auth::verify_digest(&secret, &server_nonce, &client_nonce, digest) {
            self.auth_state = AuthState::Done;
        } else {
            self.disconnected = true;
        }
    }

    /// Synthesizes a `FUNCTION_NOT_SUPPORTED` reply to a daemon-UID
    /// request nobody can otherwise answer, mirroring the shape a real
    /// hardware stack's error response would take.
    fn enqueue_not_supported(&mut self, request: &Packet) {
        let response = match PacketBuilder::new(DAEMON_UID, request.function_id())
            .sequence_number(request.sequence_number())
            .error_code(FUNCTION_NOT_SUPPORTED)
            .build()
        {
            Ok(packet) => packet,
            Err(_) => return,
        };

        self.enqueue(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBuilder;
    use std::os::unix::io::AsRawFd;

    struct NullStream;

    impl AsRawFd for NullStream {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl IoStream for NullStream {
        fn read_nonblocking(&mut self, _buf: &mut [u8]) -> std::io::Result<Status> {
            Ok(Status::WouldBlock)
        }

        fn write_nonblocking(&mut self, _buf: &[u8]) -> std::io::Result<Status> {
            Ok(Status::WouldBlock)
        }

        fn peer_description(&self) -> String {
            "null".to_string()
        }
    }

    #[test]
    fn test_disabled_auth_routes_immediately() {
        let mut client = Client::new(1, -1, "peer".to_string(), None);
        let packet = PacketBuilder::new(42, 5).build().unwrap();

        assert!(client.handle_packet(packet).is_some());
    }

    #[test]
    fn test_enabled_auth_blocks_until_done() {
        let mut client = Client::new(1, -1, "peer".to_string(), Some(b"secret".to_vec()));
        let packet = PacketBuilder::new(42, 5).build().unwrap();

        assert!(client.handle_packet(packet).is_none());
        assert!(client.disconnected);
    }

    #[test]
    fn test_full_handshake_then_routes() {
        let secret = b"top-secret".to_vec();
        let mut client = Client::new(1, -1, "peer".to_string(), Some(secret.clone()));

        let nonce_request = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).build().unwrap();
        client.handle_packet(nonce_request);

        let server_nonce = match client.auth_state {
            AuthState::NonceSent { server_nonce } => server_nonce,
            other => panic!("expected NonceSent, got {:?}", other),
        };

        let client_nonce = auth::generate_nonce();
        let digest = auth::compute_digest(&secret, &server_nonce, &client_nonce);

        let mut payload = client_nonce.to_vec();
        payload.extend_from_slice(&digest);

        let authenticate = PacketBuilder::new(DAEMON_UID, FUNCTION_AUTHENTICATE).payload(payload).build().unwrap();
        client.handle_packet(authenticate);

        assert_eq!(client.auth_state, AuthState::Done);
        assert!(client.is_authenticated());

        let ordinary = PacketBuilder::new(99, 1).build().unwrap();
        assert!(client.handle_packet(ordinary).is_some());
    }

    #[test]
    fn test_disconnect_probe_is_dropped_silently() {
        let mut client = Client::new(1, -1, "peer".to_string(), None);
        let probe = PacketBuilder::new(42, FUNCTION_DISCONNECT_PROBE).build().unwrap();

        assert!(client.handle_packet(probe).is_none());
        assert!(!client.disconnected);
    }

    #[test]
    fn test_redundant_nonce_request_in_done_resets_to_nonce_sent() {
        let secret = b"top-secret".to_vec();
        let mut client = Client::new(1, -1, "peer".to_string(), Some(secret.clone()));

        let nonce_request = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).build().unwrap();
        client.handle_packet(nonce_request.clone());
        let first_nonce = match client.auth_state {
            AuthState::NonceSent { server_nonce } => server_nonce,
            other => panic!("expected NonceSent, got {:?}", other),
        };

        let digest = auth::compute_digest(&secret, &first_nonce, &auth::generate_nonce());
        let mut payload = auth::generate_nonce().to_vec();
        payload.extend_from_slice(&digest);
        let authenticate = PacketBuilder::new(DAEMON_UID, FUNCTION_AUTHENTICATE).payload(payload).build().unwrap();
        client.handle_packet(authenticate);
        assert_eq!(client.auth_state, AuthState::Done);

        client.handle_packet(nonce_request);
        assert!(matches!(client.auth_state, AuthState::NonceSent { .. }));
    }

    #[test]
    fn test_oversized_nonce_request_disconnects() {
        let mut client = Client::new(1, -1, "peer".to_string(), Some(b"secret".to_vec()));
        let bogus = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).payload(vec![0]).build().unwrap();

        assert!(client.handle_packet(bogus).is_none());
        assert!(client.disconnected);
    }

    #[test]
    fn test_oversized_authenticate_disconnects() {
        let mut client = Client::new(1, -1, "peer".to_string(), Some(b"secret".to_vec()));
        let nonce_request = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).build().unwrap();
        client.handle_packet(nonce_request);

        let oversized_payload = vec![0u8; auth::NONCE_LENGTH + auth::DIGEST_LENGTH + 1];
        let authenticate = PacketBuilder::new(DAEMON_UID, FUNCTION_AUTHENTICATE).payload(oversized_payload).build().unwrap();

        assert!(client.handle_packet(authenticate).is_none());
        assert!(client.disconnected);
    }

    #[test]
    fn test_unknown_daemon_function_with_response_expected_yields_not_supported() {
        let mut client = Client::new(1, -1, "peer".to_string(), None);
        let request = PacketBuilder::new(DAEMON_UID, 99).response_expected(true).sequence_number(4).build().unwrap();

        assert!(client.handle_packet(request).is_none());
        assert!(!client.disconnected);
        assert!(client.has_pending_writes());
    }

    #[test]
    fn test_unknown_daemon_function_without_response_expected_is_silent() {
        let mut client = Client::new(1, -1, "peer".to_string(), None);
        let request = PacketBuilder::new(DAEMON_UID, 99).build().unwrap();

        assert!(client.handle_packet(request).is_none());
        assert!(!client.disconnected);
        assert!(!client.has_pending_writes());
    }
}
