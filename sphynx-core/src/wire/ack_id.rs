//! Variable-length ACK-ID field. Byte 0 holds `S(2) | IDA(5) | C(1)`, byte 1 (if continued) holds
//! `IDB(7) | C(1)`, byte 2 (if continued) holds `IDC(8)`, giving a 20-bit ID.

use super::{read_u8, Result};

pub const MAX_ID: u32 = (1 << 20) - 1;
pub const MAX_STREAM: u8 = 3;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckId {
    pub stream: u8,
    pub id: u32,
}

impl AckId {
    /// Encode, using the shortest representation that fits `id` unless `force_full` is set
    /// (retransmissions always emit all 3 bytes, since the receiver's compression state is
    /// unknown to the sender at that point).
    pub fn encode(&self, force_full: bool, out: &mut Vec<u8>) {
        debug_assert!(self.stream <= MAX_STREAM);
        debug_assert!(self.id <= MAX_ID);
        let ida = (self.id & 0x1f) as u8;
        let idb = ((self.id >> 5) & 0x7f) as u8;
        let idc = (self.id >> 12) as u8;

        let need_byte2 = force_full || self.id > 0x1f;
        let need_byte3 = force_full || self.id > 0x1f_7f;

        let mut b0 = self.stream | (ida << 2);
        if need_byte2 {
            b0 |= 1 << 7;
        }
        out.push(b0);
        if need_byte2 {
            let mut b1 = idb;
            if need_byte3 {
                b1 |= 1 << 7;
            }
            out.push(b1);
            if need_byte3 {
                out.push(idc);
            }
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<AckId> {
        let b0 = read_u8(buf)?;
        let stream = b0 & 0x3;
        let ida = (b0 >> 2) & 0x1f;
        if (b0 >> 7) & 1 == 0 {
            return Ok(AckId {
                stream,
                id: u32::from(ida),
            });
        }
        let b1 = read_u8(buf)?;
        let idb = b1 & 0x7f;
        if (b1 >> 7) & 1 == 0 {
            return Ok(AckId {
                stream,
                id: u32::from(ida) | (u32::from(idb) << 5),
            });
        }
        let idc = read_u8(buf)?;
        Ok(AckId {
            stream,
            id: u32::from(ida) | (u32::from(idb) << 5) | (u32::from(idc) << 12),
        })
    }

    /// Length in bytes the shortest (non-forced) encoding would take.
    #[inline]
    pub fn shortest_len(id: u32) -> usize {
        if id <= 0x1f {
            1
        } else if id <= 0x1f_7f {
            2
        } else {
            3
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(stream: u8, id: u32, force_full: bool) {
        let ack_id = AckId { stream, id };
        let mut buf = Vec::new();
        ack_id.encode(force_full, &mut buf);
        if force_full {
            assert_eq!(buf.len(), 3);
        }
        let mut slice = &buf[..];
        let decoded = AckId::decode(&mut slice).unwrap();
        assert_eq!(decoded, ack_id);
        assert!(slice.is_empty());
    }

    #[test]
    fn one_byte_range() {
        roundtrip(1, 0, false);
        roundtrip(3, 0x1f, false);
    }

    #[test]
    fn two_byte_range() {
        roundtrip(0, 0x20, false);
        roundtrip(2, 0x1f_7f, false);
    }

    #[test]
    fn three_byte_range() {
        roundtrip(1, 0x1f_80, false);
        roundtrip(1, MAX_ID, false);
    }

    #[test]
    fn retransmission_forces_full_width() {
        roundtrip(0, 0, true);
        roundtrip(0, 5, true);
    }

    #[test]
    fn shortest_len_matches_encoded_size() {
        for id in [0u32, 0x1f, 0x20, 0x1f_7f, 0x1f_80, MAX_ID] {
            let mut buf = Vec::new();
            AckId { stream: 0, id }.encode(false, &mut buf);
            assert_eq!(buf.len(), AckId::shortest_len(id));
        }
    }
}
