//! Drives a `Client` through the same sequence `bridged`'s read callback
//! does -- nonce request, authenticate, then an ordinary packet -- over a
//! scripted `IoStream` standing in for the socket.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bridge_core::auth;
use bridge_core::client::{Client, DAEMON_UID};
use bridge_core::io::{IoStream, Status};
use bridge_core::packet::{Packet, PacketBuilder, FUNCTION_AUTHENTICATE, FUNCTION_GET_AUTH_NONCE};
use support::logging;

struct ScriptedStream {
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
}

impl AsRawFd for ScriptedStream {
    fn as_raw_fd(&self) -> RawFd {
        -1
    }
}

impl IoStream for ScriptedStream {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<Status> {
        if self.incoming.is_empty() {
            return Ok(Status::WouldBlock);
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.drain(..n);
        Ok(Status::Progress(n))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> io::Result<Status> {
        self.outgoing.extend_from_slice(buf);
        Ok(Status::Progress(buf.len()))
    }

    fn peer_description(&self) -> String {
        "scripted".to_string()
    }
}

#[test]
fn test_full_handshake_then_ordinary_request_is_routable() {
    let secret = b"shared-secret".to_vec();
    let mut client = Client::new(1, -1, "test-peer".to_string(), Some(secret.clone()));
    let log = logging::discard();

    let nonce_request = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).build().unwrap();
    let mut io = ScriptedStream { incoming: nonce_request.into_bytes(), outgoing: Vec::new() };

    let outcome = client.on_readable(&mut io, &log);
    assert!(outcome.routable.is_empty());
    assert!(!outcome.disconnect);
    assert!(!io.outgoing.is_empty(), "nonce response should have been queued");

    let nonce_response = Packet::parse(io.outgoing.clone()).unwrap();
    let mut server_nonce = [0u8; auth::NONCE_LENGTH];
    server_nonce.copy_from_slice(&nonce_response.payload()[..auth::NONCE_LENGTH]);

    let client_nonce = auth::generate_nonce();
    let digest = auth::compute_digest(&secret, &server_nonce, &client_nonce);
    let mut payload = client_nonce.to_vec();
    payload.extend_from_slice(&digest);

    let authenticate = PacketBuilder::new(DAEMON_UID, FUNCTION_AUTHENTICATE).payload(payload).build().unwrap();
    io.incoming = authenticate.into_bytes();
    io.outgoing.clear();

    let outcome = client.on_readable(&mut io, &log);
    assert!(outcome.routable.is_empty());
    assert!(!outcome.disconnect);
    assert!(client.is_authenticated());

    let request = PacketBuilder::new(42, 7).sequence_number(1).response_expected(true).build().unwrap();
    io.incoming = request.into_bytes();

    let outcome = client.on_readable(&mut io, &log);
    assert_eq!(outcome.routable.len(), 1);
    assert_eq!(outcome.routable[0].uid(), 42);
}

#[test]
fn test_wrong_digest_disconnects_without_routing() {
    let secret = b"shared-secret".to_vec();
    let mut client = Client::new(1, -1, "test-peer".to_string(), Some(secret));
    let log = logging::discard();

    let nonce_request = PacketBuilder::new(DAEMON_UID, FUNCTION_GET_AUTH_NONCE).build().unwrap();
    let mut io = ScriptedStream { incoming: nonce_request.into_bytes(), outgoing: Vec::new() };
    client.on_readable(&mut io, &log);

    let bogus_payload = vec![0u8; auth::NONCE_LENGTH + auth::DIGEST_LENGTH];
    let authenticate = PacketBuilder::new(DAEMON_UID, FUNCTION_AUTHENTICATE).payload(bogus_payload).build().unwrap();
    io.incoming = authenticate.into_bytes();

    let outcome = client.on_readable(&mut io, &log);
    assert!(outcome.disconnect);
    assert!(!client.is_authenticated());
}
