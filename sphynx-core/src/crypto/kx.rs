//! Ephemeral X25519 key exchange used during the handshake. Forward secrecy holds because these
//! keys are generated fresh per handshake attempt and discarded once the session key is derived.

pub struct EphemeralKeyPair {
    sk: [u8; 32],
    pk: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> EphemeralKeyPair {
        let mut sk = [0u8; 32];
        super::random_bytes(&mut sk);
        let mut pk = [0u8; 32];
        unsafe {
            libsodium_sys::crypto_scalarmult_base(pk.as_mut_ptr(), sk.as_ptr());
        }
        EphemeralKeyPair { sk, pk }
    }

    #[inline]
    pub fn public(&self) -> &[u8; 32] {
        &self.pk
    }

    /// The X25519 shared secret with a peer's ephemeral public key. Returns `None` if the peer
    /// key is a low-order point (libsodium rejects it rather than producing a degenerate
    /// secret), which the handshake treats as a tampering failure.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> Option<[u8; 32]> {
        let mut shared = [0u8; 32];
        let rc = unsafe {
            libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), self.sk.as_ptr(), peer_public.as_ptr())
        };
        if rc == 0 {
            Some(shared)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let client = EphemeralKeyPair::generate();
        let server = EphemeralKeyPair::generate();
        let client_secret = client.shared_secret(server.public()).unwrap();
        let server_secret = server.shared_secret(client.public()).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn low_order_point_rejected() {
        let client = EphemeralKeyPair::generate();
        let all_zero = [0u8; 32];
        assert!(client.shared_secret(&all_zero).is_none());
    }
}
