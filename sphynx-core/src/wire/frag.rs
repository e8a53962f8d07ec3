//! Fragment header: a little-endian 16-bit total-message length, present only in the first
//! fragment of a reassembled message and counted in that fragment's `DATA_BYTES`.

use super::{read_exact, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragHeader {
    pub total_bytes: u16,
}

impl FragHeader {
    pub const SIZE: usize = 2;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_bytes.to_le_bytes());
    }

    pub fn decode(buf: &mut &[u8]) -> Result<FragHeader> {
        let bytes = read_exact(buf, Self::SIZE)?;
        Ok(FragHeader {
            total_bytes: u16::from_le_bytes([bytes[0], bytes[1]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = FragHeader { total_bytes: 4000 };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(FragHeader::decode(&mut slice).unwrap(), h);
    }
}
