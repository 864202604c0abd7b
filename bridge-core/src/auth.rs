//! HMAC-SHA1 helper used by the client authentication handshake
//! (spec.md §4.3.1). Grounded on `brickd/client.c`'s handshake sequence;
//! expressed with RustCrypto's `hmac`/`sha1` since the pack has no prior
//! art for a keyed digest.

use hmac::{Hmac, Mac, NewMac};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const NONCE_LENGTH: usize = 4;
pub const DIGEST_LENGTH: usize = 20;

/// Generates a fresh 4-byte server nonce for `GET_AUTH_NONCE`.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Computes `HMAC-SHA1(secret, server_nonce || client_nonce)`, the digest
/// both sides compute independently and compare in `AUTHENTICATE`.
pub fn compute_digest(secret: &[u8], server_nonce: &[u8; NONCE_LENGTH], client_nonce: &[u8; NONCE_LENGTH]) -> [u8; DIGEST_LENGTH] {
    let mut mac = HmacSha1::new_varkey(secret).expect("HMAC accepts a key of any length");
    mac.update(server_nonce);
    mac.update(client_nonce);

    let result = mac.finalize().into_bytes();
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&result);
    digest
}

/// Verifies a client-supplied digest in constant time with respect to
/// byte content (the `subtle`-style comparison `hmac`'s own `verify`
/// already performs), returning whether authentication succeeds.
pub fn verify_digest(secret: &[u8], server_nonce: &[u8; NONCE_LENGTH], client_nonce: &[u8; NONCE_LENGTH], supplied: &[u8]) -> bool {
    let mut mac = match HmacSha1::new_varkey(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(server_nonce);
    mac.update(client_nonce);

    mac.verify(supplied).is_ok()
}
