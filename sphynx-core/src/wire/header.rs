//! Message block header: a 1- or 2-byte bit-packed header preceding a block's optional ACK-ID
//! field and data.

use super::{read_u8, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SuperOpcode {
    Data = 0,
    Frag = 1,
    Ack = 2,
    Internal = 3,
}

impl SuperOpcode {
    #[inline]
    fn from_bits(bits: u8) -> SuperOpcode {
        match bits & 0x3 {
            0 => SuperOpcode::Data,
            1 => SuperOpcode::Frag,
            2 => SuperOpcode::Ack,
            _ => SuperOpcode::Internal,
        }
    }
}

/// Largest `DATA_BYTES` the header can express: 3 low bits (BLO) plus 8 high bits (BHI).
pub const MAX_DATA_BYTES: u16 = 0x7 | (0xff << 3);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockHeader {
    pub data_bytes: u16,
    /// `true` when an ACK-ID field follows the header (the `I` bit).
    pub has_ack_id: bool,
    pub reliable: bool,
    pub sop: SuperOpcode,
}

impl BlockHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.data_bytes <= MAX_DATA_BYTES);
        let blo = (self.data_bytes & 0x7) as u8;
        let bhi = (self.data_bytes >> 3) as u8;
        let c = bhi != 0;
        let mut b0 = blo;
        if self.has_ack_id {
            b0 |= 1 << 3;
        }
        if self.reliable {
            b0 |= 1 << 4;
        }
        b0 |= (self.sop as u8) << 5;
        if c {
            b0 |= 1 << 7;
        }
        out.push(b0);
        if c {
            out.push(bhi);
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<BlockHeader> {
        let b0 = read_u8(buf)?;
        let blo = b0 & 0x7;
        let has_ack_id = (b0 >> 3) & 1 != 0;
        let reliable = (b0 >> 4) & 1 != 0;
        let sop = SuperOpcode::from_bits((b0 >> 5) & 0x3);
        let c = (b0 >> 7) & 1 != 0;
        let data_bytes = if c {
            let bhi = read_u8(buf)?;
            (u16::from(bhi) << 3) | u16::from(blo)
        } else {
            u16::from(blo)
        };
        Ok(BlockHeader {
            data_bytes,
            has_ack_id,
            reliable,
            sop,
        })
    }

    /// Number of header bytes this value would encode as (1 or 2).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        if self.data_bytes >> 3 != 0 {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_elides_bhi() {
        let h = BlockHeader {
            data_bytes: 5,
            has_ack_id: true,
            reliable: true,
            sop: SuperOpcode::Data,
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), 1);
        let mut slice = &buf[..];
        let decoded = BlockHeader::decode(&mut slice).unwrap();
        assert_eq!(decoded, h);
        assert!(slice.is_empty());
    }

    #[test]
    fn long_header_roundtrip() {
        let h = BlockHeader {
            data_bytes: 900,
            has_ack_id: false,
            reliable: true,
            sop: SuperOpcode::Frag,
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), 2);
        let mut slice = &buf[..];
        assert_eq!(BlockHeader::decode(&mut slice).unwrap(), h);
    }

    #[test]
    fn all_sops_roundtrip() {
        for sop in [
            SuperOpcode::Data,
            SuperOpcode::Frag,
            SuperOpcode::Ack,
            SuperOpcode::Internal,
        ] {
            let h = BlockHeader {
                data_bytes: 0,
                has_ack_id: false,
                reliable: false,
                sop,
            };
            let mut buf = Vec::new();
            h.encode(&mut buf);
            let mut slice = &buf[..];
            assert_eq!(BlockHeader::decode(&mut slice).unwrap().sop, sop);
        }
    }

    #[test]
    fn truncated_header_is_tampering() {
        let mut slice: &[u8] = &[];
        assert!(BlockHeader::decode(&mut slice).is_err());
    }
}
