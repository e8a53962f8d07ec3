//! Wire codec: pure functions over byte buffers for the message header, ACK-ID field, fragment
//! header and ACK body. Nothing in this module touches sockets, connections or cryptography — it
//! only knows how to turn structured values into bytes and back, using plain little-endian
//! `to_le_bytes`/`from_le_bytes` conversions over borrowed slices, `Error::Tampering` on
//! malformed or truncated input, and a bit-packed header rather than fixed-width token fields.

pub mod ack_body;
pub mod ack_id;
pub mod frag;
pub mod header;

pub use ack_body::{AckBody, AckRange};
pub use ack_id::AckId;
pub use frag::FragHeader;
pub use header::{BlockHeader, SuperOpcode};

use crate::error::Error;
pub(crate) use crate::error::Result;

/// Read a single byte from a cursor-style slice, advancing it. Returns `Tampering` on EOF —
/// every malformed datagram is dropped whole, never partially trusted.
#[inline]
pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(Error::Tampering);
    }
    let b = buf[0];
    *buf = &buf[1..];
    Ok(b)
}

#[inline]
pub(crate) fn read_exact<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::Tampering);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
pub(crate) fn write_u8(out: &mut Vec<u8>, b: u8) {
    out.push(b);
}
