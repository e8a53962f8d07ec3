//! ACK body codec: a sequence of `(ROLLUP, RANGE*)` groups, one group per stream with pending
//! acknowledgments.

use super::{read_u8, Result};
use crate::error::Error;

/// An inclusive ID interval acknowledged within one stream's group. `end: None` means a
/// single-ID range (the wire's `E=0` case).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckRange {
    pub start: u32,
    pub end: Option<u32>,
}

/// One stream's acknowledgment group: a cumulative rollup plus zero or more ranges above it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamAck {
    pub stream: u8,
    pub rollup: u32,
    pub ranges: Vec<AckRange>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct AckBody {
    pub streams: Vec<StreamAck>,
}

impl AckBody {
    pub fn encode(&self, out: &mut Vec<u8>) {
        for group in &self.streams {
            encode_rollup(group.stream, group.rollup, out);
            for range in &group.ranges {
                encode_range(range, out);
            }
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<AckBody> {
        let mut streams = Vec::new();
        while !buf.is_empty() {
            let (stream, rollup) = decode_rollup(&mut buf)?;
            let mut ranges = Vec::new();
            while let Some(&b0) = buf.first() {
                if b0 & 1 == 1 {
                    // top bit (ROLLUP tag) set: next stream's group begins
                    break;
                }
                ranges.push(decode_range(&mut buf)?);
            }
            streams.push(StreamAck {
                stream,
                rollup,
                ranges,
            });
        }
        Ok(AckBody { streams })
    }
}

fn encode_rollup(stream: u8, id: u32, out: &mut Vec<u8>) {
    debug_assert!(id <= (1 << 21) - 1);
    let ida = (id & 0x1f) as u8;
    let idb = ((id >> 5) & 0xff) as u8;
    let idc = (id >> 13) as u8;
    let b0 = 1 | (stream << 1) | (ida << 3);
    out.push(b0);
    out.push(idb);
    out.push(idc);
}

fn decode_rollup(buf: &mut &[u8]) -> Result<(u8, u32)> {
    let b0 = read_u8(buf)?;
    if b0 & 1 == 0 {
        return Err(Error::Tampering);
    }
    let stream = (b0 >> 1) & 0x3;
    let ida = (b0 >> 3) & 0x1f;
    let idb = read_u8(buf)?;
    let idc = read_u8(buf)?;
    let id = u32::from(ida) | (u32::from(idb) << 5) | (u32::from(idc) << 13);
    Ok((stream, id))
}

fn encode_range(range: &AckRange, out: &mut Vec<u8>) {
    let e = range.end.is_some();
    let ida = (range.start & 0x1f) as u8;
    let idb = ((range.start >> 5) & 0x7f) as u8;
    let idc = (range.start >> 12) as u8;
    let need2 = range.start > 0x1f;
    let need3 = range.start > 0x1f_7f;

    let mut b0 = ida << 2;
    if e {
        b0 |= 1 << 1;
    }
    if need2 {
        b0 |= 1 << 7;
    }
    out.push(b0);
    if need2 {
        let mut b1 = idb;
        if need3 {
            b1 |= 1 << 7;
        }
        out.push(b1);
        if need3 {
            out.push(idc);
        }
    }

    if let Some(end) = range.end {
        let delta = end - range.start;
        let ida = (delta & 0x7f) as u8;
        let idb = ((delta >> 7) & 0x7f) as u8;
        let idc = (delta >> 14) as u8;
        let need2 = delta > 0x7f;
        let need3 = delta > 0x3f_ff;

        let mut b0 = ida;
        if need2 {
            b0 |= 1 << 7;
        }
        out.push(b0);
        if need2 {
            let mut b1 = idb;
            if need3 {
                b1 |= 1 << 7;
            }
            out.push(b1);
            if need3 {
                out.push(idc);
            }
        }
    }
}

fn decode_range(buf: &mut &[u8]) -> Result<AckRange> {
    let b0 = read_u8(buf)?;
    if b0 & 1 != 0 {
        return Err(Error::Tampering);
    }
    let has_end = (b0 >> 1) & 1 != 0;
    let ida = (b0 >> 2) & 0x1f;
    let start = if (b0 >> 7) & 1 == 0 {
        u32::from(ida)
    } else {
        let b1 = read_u8(buf)?;
        let idb = b1 & 0x7f;
        if (b1 >> 7) & 1 == 0 {
            u32::from(ida) | (u32::from(idb) << 5)
        } else {
            let idc = read_u8(buf)?;
            u32::from(ida) | (u32::from(idb) << 5) | (u32::from(idc) << 12)
        }
    };

    if !has_end {
        return Ok(AckRange { start, end: None });
    }

    let b0 = read_u8(buf)?;
    let ida = b0 & 0x7f;
    let delta = if (b0 >> 7) & 1 == 0 {
        u32::from(ida)
    } else {
        let b1 = read_u8(buf)?;
        let idb = b1 & 0x7f;
        if (b1 >> 7) & 1 == 0 {
            u32::from(ida) | (u32::from(idb) << 7)
        } else {
            let idc = read_u8(buf)?;
            u32::from(ida) | (u32::from(idb) << 7) | (u32::from(idc) << 14)
        }
    };

    Ok(AckRange {
        start,
        end: Some(start + delta),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stream_rollup_only() {
        let body = AckBody {
            streams: vec![StreamAck {
                stream: 1,
                rollup: 42,
                ranges: vec![],
            }],
        };
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert_eq!(buf.len(), 3);
        assert_eq!(AckBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn rollup_plus_ranges() {
        let body = AckBody {
            streams: vec![StreamAck {
                stream: 2,
                rollup: 10,
                ranges: vec![
                    AckRange { start: 20, end: Some(25) },
                    AckRange { start: 40, end: None },
                ],
            }],
        };
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert_eq!(AckBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn multiple_streams() {
        let body = AckBody {
            streams: vec![
                StreamAck {
                    stream: 0,
                    rollup: 5,
                    ranges: vec![AckRange { start: 9, end: Some(9) }],
                },
                StreamAck {
                    stream: 3,
                    rollup: 100000,
                    ranges: vec![],
                },
            ],
        };
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert_eq!(AckBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn large_range_delta_uses_full_width() {
        let body = AckBody {
            streams: vec![StreamAck {
                stream: 1,
                rollup: 0,
                ranges: vec![AckRange { start: 100, end: Some(100 + 20000) }],
            }],
        };
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert_eq!(AckBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn empty_body_roundtrips() {
        let body = AckBody::default();
        let mut buf = Vec::new();
        body.encode(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(AckBody::decode(&buf).unwrap(), body);
    }
}
