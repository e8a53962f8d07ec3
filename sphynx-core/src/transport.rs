//! MTU ladder and per-family payload budget, plus the connection lifecycle states
//! (`Handshaking` → `Open` → `Disconnecting` → `Closed`) for callers that need to reason about a
//! peer before a `Connection` object exists.
//!
//! MTU constants and header-overhead accounting follow standard IPv4/IPv6/UDP header sizes.

use crate::addr::Family;
use crate::crypto::aead::OVERHEAD_BYTES;

pub const MTU_MIN: u16 = 576;
pub const MTU_MEDIUM: u16 = 1400;
pub const MTU_MAX: u16 = 1500;

const IPV4_HEADER_BYTES: u16 = 20;
const IPV6_HEADER_BYTES: u16 = 40;
const UDP_HEADER_BYTES: u16 = 8;

/// Usable payload budget for one datagram at `mtu`, after the IP header, the UDP header and the
/// encryption trailer: `MTU − IP header − UDP header − encryption overhead`, chosen per address
/// family.
pub fn payload_budget(mtu: u16, family: Family) -> u32 {
    let ip_header = match family {
        Family::V4 => IPV4_HEADER_BYTES,
        Family::V6 => IPV6_HEADER_BYTES,
    };
    mtu.saturating_sub(ip_header + UDP_HEADER_BYTES)
        .saturating_sub(OVERHEAD_BYTES as u16) as u32
}

/// The four lifecycle states. `Connection` itself only distinguishes `Open` from
/// `Disconnecting` (see its own `state` field) — `Handshaking` and `Closed` are represented by
/// the *absence* of a `Connection` object (not yet admitted, or already removed from the
/// connection map), per handshake.rs's "no redundant bookkeeping table" decision. This enum is
/// for callers (the dispatcher, diagnostics) that want to name all four uniformly.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Disconnecting,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_budget_is_smaller_than_mtu() {
        let budget = payload_budget(MTU_MEDIUM, Family::V4);
        assert!(budget < MTU_MEDIUM as u32);
    }

    #[test]
    fn v6_budget_is_smaller_than_v4_budget_at_same_mtu() {
        let v4 = payload_budget(MTU_MEDIUM, Family::V4);
        let v6 = payload_budget(MTU_MEDIUM, Family::V6);
        assert!(v6 < v4);
    }

    #[test]
    fn budget_never_underflows_at_min_mtu() {
        assert!(payload_budget(MTU_MIN, Family::V6) > 0);
    }
}
