//! Cookie jar: a stateless, server-side DoS-resistance token. `Generate` produces a
//! 32-bit value from a keyed PRF over the peer's address; `Verify` accepts the current or
//! previous key so that a key rotation mid-handshake doesn't strand in-flight clients.
//!
//! Keying material comes from libsodium-backed randomness; the PRF itself is BLAKE3 keyed
//! hashing, a fast keyed hash rather than a full AEAD.

use crate::addr::NetAddr;
use std::time::{Duration, Instant};

/// How long a cookie-signing key stays current before rotating, at a slow cadence relative to
/// the handshake's own time scale — a few multiples of `TIMEOUT_DISCONNECT` — so a client
/// mid-handshake never sees more than one
/// rotation.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(60);

pub struct CookieJar {
    current_key: [u8; 32],
    previous_key: [u8; 32],
    last_rotation: Instant,
}

impl CookieJar {
    pub fn new() -> CookieJar {
        let mut current_key = [0u8; 32];
        crate::crypto::random_bytes(&mut current_key);
        CookieJar {
            current_key,
            previous_key: current_key,
            last_rotation: Instant::now(),
        }
    }

    /// Roll the signing key forward if `ROTATION_INTERVAL` has elapsed. Called from the
    /// transport engine's tick; a no-op most ticks.
    pub fn maybe_rotate(&mut self, now: Instant) {
        if now.duration_since(self.last_rotation) >= ROTATION_INTERVAL {
            self.previous_key = self.current_key;
            crate::crypto::random_bytes(&mut self.current_key);
            self.last_rotation = now;
        }
    }

    pub fn generate(&self, addr: &NetAddr) -> u32 {
        Self::prf(&self.current_key, addr)
    }

    pub fn verify(&self, addr: &NetAddr, cookie: u32) -> bool {
        Self::prf(&self.current_key, addr) == cookie || Self::prf(&self.previous_key, addr) == cookie
    }

    fn prf(key: &[u8; 32], addr: &NetAddr) -> u32 {
        let mut bytes = [0u8; 19];
        addr.hash_bytes(&mut bytes);
        let hash = blake3::keyed_hash(key, &bytes);
        u32::from_le_bytes(hash.as_bytes()[..4].try_into().expect("4 bytes"))
    }
}

impl Default for CookieJar {
    fn default() -> CookieJar {
        CookieJar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(s: &str) -> NetAddr {
        NetAddr::from_socket_addr(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn roundtrip() {
        let jar = CookieJar::new();
        let a = addr("1.2.3.4:9000");
        let cookie = jar.generate(&a);
        assert!(jar.verify(&a, cookie));
    }

    #[test]
    fn different_address_does_not_verify() {
        let jar = CookieJar::new();
        let a = addr("1.2.3.4:9000");
        let b = addr("1.2.3.5:9000");
        let cookie = jar.generate(&a);
        assert!(!jar.verify(&b, cookie));
    }

    #[test]
    fn previous_key_still_verifies_after_rotation() {
        let mut jar = CookieJar::new();
        let a = addr("1.2.3.4:9000");
        let cookie = jar.generate(&a);
        jar.previous_key = jar.current_key;
        crate::crypto::random_bytes(&mut jar.current_key);
        assert!(jar.verify(&a, cookie));
    }

    #[test]
    fn repeated_hello_yields_same_cookie() {
        let jar = CookieJar::new();
        let a = addr("8.8.8.8:1234");
        assert_eq!(jar.generate(&a), jar.generate(&a));
    }
}
