//! `NetAddr`: a 16-byte address, 16-bit port and family tag, wrapping `std::net::AddrParseError`
//! into the crate's own error type and supporting both IPv4 and IPv6, including v4-in-v6
//! promotion/demotion.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// A 16-byte IP address, 16-bit port and family tag. Addresses carry a validity flag so that a
/// default-constructed `NetAddr` (e.g. a connection map slot's key before first use) is
/// distinguishable from a real peer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct NetAddr {
    octets: [u8; 16],
    port: u16,
    family: Family,
    valid: bool,
}

impl NetAddr {
    pub const INVALID: NetAddr = NetAddr {
        octets: [0; 16],
        port: 0,
        family: Family::V4,
        valid: false,
    };

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn family(&self) -> Family {
        self.family
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn octets(&self) -> &[u8; 16] {
        &self.octets
    }

    pub fn from_socket_addr(addr: SocketAddr) -> NetAddr {
        match addr.ip() {
            IpAddr::V4(v4) => NetAddr {
                octets: v4.to_ipv6_mapped().octets(),
                port: addr.port(),
                family: Family::V4,
                valid: true,
            },
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    NetAddr {
                        octets: v4.to_ipv6_mapped().octets(),
                        port: addr.port(),
                        family: Family::V4,
                        valid: true,
                    }
                } else {
                    NetAddr {
                        octets: v6.octets(),
                        port: addr.port(),
                        family: Family::V6,
                        valid: true,
                    }
                }
            }
        }
    }

    /// Demote a v4-in-v6 address back to its `SocketAddr` representation, preferring IPv4 when
    /// the connection's family tag says so.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.octets);
        match self.family {
            Family::V4 => {
                let v4 = v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
                SocketAddr::new(IpAddr::V4(v4), self.port)
            }
            Family::V6 => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    /// Bytes fed to the cookie PRF and to the connection map's hash: family tag, port, address.
    pub fn hash_bytes(&self, out: &mut [u8; 19]) {
        out[0] = self.family as u8;
        out[1..3].copy_from_slice(&self.port.to_le_bytes());
        out[3..19].copy_from_slice(&self.octets);
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return write!(f, "<invalid>");
        }
        write!(f, "{}", self.to_socket_addr())
    }
}
