//! Static (long-term) key pair: a 32-byte seed is the only persisted secret; the Ed25519 signing
//! pair and the X25519 key-exchange pair are both derived from it.

use std::io;

pub const SEED_BYTES: usize = 32;
pub const PUBLIC_KEY_BYTES: usize = 64;

const KX_SEED_CONTEXT: &[u8] = b"sphynx static kx v1";

/// Server/client long-term identity. `public_key()` is `sign_pk ‖ kx_pk`, matching
/// `PUBLIC_KEY_BYTES = 64` from the wire format.
pub struct StaticKeyPair {
    seed: [u8; SEED_BYTES],
    sign_pk: [u8; 32],
    sign_sk: [u8; 64],
    kx_sk: [u8; 32],
    kx_pk: [u8; 32],
}

impl StaticKeyPair {
    /// Derive every key material this identity needs from a 32-byte seed.
    pub fn from_seed(seed: [u8; SEED_BYTES]) -> StaticKeyPair {
        let mut sign_pk = [0u8; 32];
        let mut sign_sk = [0u8; 64];
        unsafe {
            libsodium_sys::crypto_sign_seed_keypair(
                sign_pk.as_mut_ptr(),
                sign_sk.as_mut_ptr(),
                seed.as_ptr(),
            );
        }

        let kx_sk = blake3::derive_key(
            std::str::from_utf8(KX_SEED_CONTEXT).expect("static context is valid utf8"),
            &seed,
        );
        let mut kx_pk = [0u8; 32];
        unsafe {
            libsodium_sys::crypto_scalarmult_base(kx_pk.as_mut_ptr(), kx_sk.as_ptr());
        }

        StaticKeyPair {
            seed,
            sign_pk,
            sign_sk,
            kx_sk,
            kx_pk,
        }
    }

    pub fn generate() -> StaticKeyPair {
        let mut seed = [0u8; SEED_BYTES];
        super::random_bytes(&mut seed);
        StaticKeyPair::from_seed(seed)
    }

    #[inline]
    pub fn seed(&self) -> &[u8; SEED_BYTES] {
        &self.seed
    }

    /// The 64-byte wire public key: `sign_pk ‖ kx_pk`.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_BYTES] {
        let mut out = [0u8; PUBLIC_KEY_BYTES];
        out[..32].copy_from_slice(&self.sign_pk);
        out[32..].copy_from_slice(&self.kx_pk);
        out
    }

    #[inline]
    pub fn sign_pk(&self) -> &[u8; 32] {
        &self.sign_pk
    }

    #[inline]
    pub fn kx_pk(&self) -> &[u8; 32] {
        &self.kx_pk
    }

    /// Detached Ed25519 signature over an arbitrary transcript, used to authenticate the
    /// handshake `ANSWER` message.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let mut sig = [0u8; 64];
        unsafe {
            libsodium_sys::crypto_sign_detached(
                sig.as_mut_ptr(),
                std::ptr::null_mut(),
                message.as_ptr(),
                message.len() as u64,
                self.sign_sk.as_ptr(),
            );
        }
        sig
    }

    /// Load the §6 persisted key-pair file: `seed(32B) ‖ public_key(64B)`. The public key half
    /// is re-derived and checked against the stored copy to catch file corruption early.
    pub fn load_bytes(bytes: &[u8]) -> io::Result<StaticKeyPair> {
        if bytes.len() != SEED_BYTES + PUBLIC_KEY_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key file has the wrong length",
            ));
        }
        let mut seed = [0u8; SEED_BYTES];
        seed.copy_from_slice(&bytes[..SEED_BYTES]);
        let pair = StaticKeyPair::from_seed(seed);
        if pair.public_key()[..] != bytes[SEED_BYTES..] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key file's public half does not match its seed",
            ));
        }
        Ok(pair)
    }

    /// Serialize in the §6 persisted format.
    pub fn to_bytes(&self) -> [u8; SEED_BYTES + PUBLIC_KEY_BYTES] {
        let mut out = [0u8; SEED_BYTES + PUBLIC_KEY_BYTES];
        out[..SEED_BYTES].copy_from_slice(&self.seed);
        out[SEED_BYTES..].copy_from_slice(&self.public_key());
        out
    }
}

/// Verify a detached Ed25519 signature against a sender's wire public key.
pub fn verify(public_key: &[u8; PUBLIC_KEY_BYTES], message: &[u8], sig: &[u8; 64]) -> bool {
    let sign_pk = &public_key[..32];
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            sig.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            sign_pk.as_ptr(),
        ) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_from_seed() {
        let seed = [7u8; SEED_BYTES];
        let a = StaticKeyPair::from_seed(seed);
        let b = StaticKeyPair::from_seed(seed);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn sign_and_verify() {
        let pair = StaticKeyPair::generate();
        let msg = b"hello handshake";
        let sig = pair.sign(msg);
        assert!(verify(&pair.public_key(), msg, &sig));
        assert!(!verify(&pair.public_key(), b"tampered", &sig));
    }

    #[test]
    fn file_roundtrip() {
        let pair = StaticKeyPair::generate();
        let bytes = pair.to_bytes();
        let loaded = StaticKeyPair::load_bytes(&bytes).unwrap();
        assert_eq!(pair.public_key(), loaded.public_key());
    }

    #[test]
    fn corrupted_file_rejected() {
        let pair = StaticKeyPair::generate();
        let mut bytes = pair.to_bytes();
        bytes[SEED_BYTES] ^= 0xff;
        assert!(StaticKeyPair::load_bytes(&bytes).is_err());
    }
}
