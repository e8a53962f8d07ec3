//! Error taxonomy for the transport core.
//!
//! A `WouldBlock` from the OS collapses into `Wait` rather than being treated as a failure;
//! everything else is `Fatal`.

use std::fmt;
use std::io;
use std::net::AddrParseError;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// The operation would have blocked; nothing went wrong, try again later.
    Wait,
    /// A decoded message or datagram did not authenticate or was structurally invalid.
    Tampering,
    /// A reliable message or fragment arrived twice for an ID already delivered.
    Duplicate,
    /// The connection map or send/recv queues are full.
    ResourceExhausted,
    /// Address failed to parse.
    AddrParse,
    /// Catch-all for I/O failures that aren't `WouldBlock`.
    Io(io::ErrorKind),
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => Error::Wait,
            kind => Error::Io(kind),
        }
    }
}

impl From<AddrParseError> for Error {
    #[inline]
    fn from(_: AddrParseError) -> Self {
        Error::AddrParse
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Wait => write!(f, "operation would block"),
            Error::Tampering => write!(f, "message failed to authenticate"),
            Error::Duplicate => write!(f, "duplicate message"),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::AddrParse => write!(f, "address failed to parse"),
            Error::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

impl std::error::Error for Error {}

/// Whether a `Result` represents an actual failure as opposed to a harmless `Wait`.
pub trait ResultExt {
    fn has_failed(&self) -> bool;
}

impl<T> ResultExt for Result<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(Error::Wait))
    }
}
