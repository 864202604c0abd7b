//! Shared error taxonomy. Mirrors `flux::shared::NetworkError` on the Rust
//! side and `errno`/`PacketE` handling in `daemonlib` on the C side.
//!
//! `Wait` carries no payload: it means "try again later", the non-error
//! outcome of a non-blocking operation (`WOULD_BLOCK`, `EAGAIN`,
//! `EINTR`). Everything else is `Fatal` and means the owning connection
//! or transport must be torn down.

use std::fmt;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum NetworkError {
    /// Not an error: the operation would block, retry on the next
    /// readiness notification.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorType {
    /// `length` outside `[8, 80]`.
    InvalidLength,
    /// `function_id == 0` on a request.
    InvalidFunction,
    /// `sequence_number == 0` on a request.
    InvalidSequence,
    /// A response frame failed §4.4's response-validation rules.
    InvalidResponse,
    AddrParse,
    Crypto,
    Io(io::ErrorKind),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation would block"),
            NetworkError::Fatal(kind) => write!(f, "fatal network error: {:?}", kind),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

/// Convenience predicate used throughout the reactor loops: did this
/// result actually fail, as opposed to merely needing a retry?
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}
