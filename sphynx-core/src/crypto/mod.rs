//! Cryptography: libsodium-backed AEAD, the static/ephemeral key-exchange scheme used by the
//! handshake, and the connection's post-handshake authenticated-encryption context.
//!
//! Built on `libsodium-sys` (ChaCha20-Poly1305 IETF AEAD, Ed25519 signing, X25519 key exchange)
//! with a `ctor`-driven one-time `sodium_init` at process start. The handshake wire sizes (64B
//! public key, 64B challenge, 128B answer) are fixed by this instantiation.

pub mod aead;
pub mod keys;
pub mod kx;

pub use aead::{Aead, OVERHEAD_BYTES};
pub use keys::StaticKeyPair;
pub use kx::EphemeralKeyPair;

use ctor::ctor;

#[ctor]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("libsodium initialization failed");
        }
    }
}

/// Fills `out` with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut std::ffi::c_void, out.len());
    }
}

/// Derive a 32-byte session key from the X25519 shared secret, both handshake salts and the
/// out-of-band pre-shared session key (mirrors `flux::session::server::SessionKey`).
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    client_salt: &[u8; 32],
    server_salt: &[u8; 32],
    preshared_session_key: &[u8; 32],
) -> [u8; 32] {
    let mut material = Vec::with_capacity(32 * 4);
    material.extend_from_slice(shared_secret);
    material.extend_from_slice(client_salt);
    material.extend_from_slice(server_salt);
    material.extend_from_slice(preshared_session_key);
    *blake3::keyed_hash(blake3::hash(b"sphynx session key v1").as_bytes(), &material).as_bytes()
}

/// Split one derived session key into a pair of per-direction AEAD keys, so the two ends of a
/// connection never seal with the same key under independent nonce counters. Returns
/// `(client_to_server, server_to_client)`; callers pick the matching half for `send_key` and
/// `recv_key` depending on which side they are.
pub fn directional_keys(session_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let c2s = blake3::derive_key("sphynx c2s key v1", session_key);
    let s2c = blake3::derive_key("sphynx s2c key v1", session_key);
    (c2s, s2c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_keys_differ_and_are_deterministic() {
        let session_key = [9u8; 32];
        let (c2s_a, s2c_a) = directional_keys(&session_key);
        let (c2s_b, s2c_b) = directional_keys(&session_key);
        assert_eq!(c2s_a, c2s_b);
        assert_eq!(s2c_a, s2c_b);
        assert_ne!(c2s_a, s2c_a);
    }
}
