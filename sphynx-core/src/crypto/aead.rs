//! Per-connection authenticated-encryption context: an opaque IV + MAC trailer appended to every
//! datagram. ChaCha20-Poly1305 IETF via libsodium. The 96-bit nonce is a per-connection monotonic
//! datagram counter; only
//! its low 32 bits ride on the wire, the same way a QUIC short header reconstructs the packet
//! number from the largest one successfully processed so far, so `OVERHEAD_BYTES` stays small
//! and constant regardless of how long a connection has been open.
//!
//! A valid MAC only proves the datagram was produced by the holder of the key, not that it's
//! fresh — `open` also checks the reconstructed counter against a sliding bitmap window trailing
//! `recv_high_watermark`, rejecting anything already accepted or too far behind it, so a captured
//! datagram can't be replayed.

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

/// Transmitted nonce bytes (the low 32 bits of the counter) plus the MAC.
pub const OVERHEAD_BYTES: usize = 4 + MAC_SIZE;

/// Width of the replay-protection sliding window, in counter values below the watermark. Wide
/// enough to ride out ordinary UDP reordering without rejecting anything legitimate.
const REPLAY_WINDOW_BITS: u32 = 128;

fn expand_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Reconstruct the full 64-bit counter from its transmitted low 32 bits, choosing the candidate
/// closest to `expected` (the next counter value this side hasn't yet seen).
fn reconstruct_counter(low: u32, expected: u64) -> u64 {
    let base = expected & !0xffff_ffff;
    let candidate = base | u64::from(low);
    let half = 1u64 << 31;
    if candidate + half < expected {
        candidate + (1 << 32)
    } else if candidate > expected + half && candidate >= (1 << 32) {
        candidate - (1 << 32)
    } else {
        candidate
    }
}

/// The authenticated-encryption context installed once a handshake completes.
pub struct Aead {
    key: [u8; KEY_SIZE],
    send_counter: u64,
    /// Largest counter value this side has successfully decrypted; drives reconstruction of the
    /// next incoming datagram's full counter from its transmitted low bits.
    recv_high_watermark: u64,
    /// Bit `i` set means `recv_high_watermark - i` has already been accepted. Bit 0 is the
    /// watermark itself; never consulted until at least one datagram has been accepted (the
    /// initial `recv_high_watermark == 0` + empty mask correctly admits counter 0).
    replay_window: u128,
    has_received: bool,
}

impl Aead {
    pub fn new(key: [u8; KEY_SIZE]) -> Aead {
        Aead {
            key,
            send_counter: 0,
            recv_high_watermark: 0,
            replay_window: 0,
            has_received: false,
        }
    }

    /// Encrypt `plain` in place, appending the trailer (transmitted nonce bytes ‖ MAC) to `out`.
    /// `additional_data` is authenticated but not encrypted (used for the handshake-bound
    /// associated data, if any).
    pub fn seal(&mut self, plain: &[u8], additional_data: &[u8], out: &mut Vec<u8>) {
        let counter = self.send_counter;
        self.send_counter += 1;
        let nonce = expand_nonce(counter);

        let cipher_start = out.len();
        out.resize(cipher_start + plain.len(), 0);
        let mut mac = [0u8; MAC_SIZE];
        unsafe {
            libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt_detached(
                out[cipher_start..].as_mut_ptr(),
                mac.as_mut_ptr(),
                std::ptr::null_mut(),
                plain.as_ptr(),
                plain.len() as u64,
                additional_data.as_ptr(),
                additional_data.len() as u64,
                std::ptr::null(),
                nonce.as_ptr(),
                self.key.as_ptr(),
            );
        }
        out.extend_from_slice(&(counter as u32).to_le_bytes());
        out.extend_from_slice(&mac);
    }

    /// Verify and decrypt a full datagram (`sealed` ends with the `OVERHEAD_BYTES` trailer).
    /// Returns the plaintext, or `None` on any authentication failure *or* a replayed/too-stale
    /// counter — the whole datagram is dropped, never partially trusted. A valid MAC alone isn't
    /// enough: a captured datagram carries a valid MAC forever, so freshness against the replay
    /// window is checked before and after decryption.
    pub fn open(&mut self, sealed: &[u8], additional_data: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < OVERHEAD_BYTES {
            return None;
        }
        let split = sealed.len() - OVERHEAD_BYTES;
        let cipher = &sealed[..split];
        let nonce_low = u32::from_le_bytes(sealed[split..split + 4].try_into().ok()?);
        let mac: [u8; MAC_SIZE] = sealed[split + 4..].try_into().ok()?;

        let counter = reconstruct_counter(nonce_low, self.recv_high_watermark);
        if self.has_received && !self.in_window(counter) {
            return None;
        }
        let nonce = expand_nonce(counter);

        let mut plain = vec![0u8; cipher.len()];
        let ok = unsafe {
            libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt_detached(
                plain.as_mut_ptr(),
                std::ptr::null_mut(),
                cipher.as_ptr(),
                cipher.len() as u64,
                mac.as_ptr(),
                additional_data.as_ptr(),
                additional_data.len() as u64,
                nonce.as_ptr(),
                self.key.as_ptr(),
            ) == 0
        };
        if !ok {
            return None;
        }
        self.accept(counter);
        Some(plain)
    }

    /// Whether `counter` is not an already-seen duplicate and not older than the sliding window
    /// trailing `recv_high_watermark`. Does not itself mark anything seen; call only after a
    /// datagram authenticates to record it via [`Aead::accept`].
    fn in_window(&self, counter: u64) -> bool {
        if counter > self.recv_high_watermark {
            return true;
        }
        let age = self.recv_high_watermark - counter;
        if age >= u64::from(REPLAY_WINDOW_BITS) {
            return false; // too far behind the watermark: treat as a stale replay
        }
        self.replay_window & (1u128 << age) == 0
    }

    /// Record `counter` as accepted, advancing the watermark and sliding the bitmap if it's the
    /// new high point, or just flipping its bit if it landed inside the existing window.
    fn accept(&mut self, counter: u64) {
        if !self.has_received {
            self.has_received = true;
            self.recv_high_watermark = counter;
            self.replay_window = 1;
            return;
        }
        if counter > self.recv_high_watermark {
            let shift = counter - self.recv_high_watermark;
            self.replay_window = if shift >= u64::from(REPLAY_WINDOW_BITS) {
                0
            } else {
                self.replay_window << shift
            };
            self.replay_window |= 1;
            self.recv_high_watermark = counter;
        } else {
            let age = self.recv_high_watermark - counter;
            self.replay_window |= 1u128 << age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        [42u8; KEY_SIZE]
    }

    #[test]
    fn seal_open_roundtrip() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        let mut out = Vec::new();
        sender.seal(b"hello world", b"", &mut out);
        let plain = receiver.open(&out, b"").unwrap();
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn tampered_datagram_is_rejected() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        let mut out = Vec::new();
        sender.seal(b"hello world", b"", &mut out);
        *out.last_mut().unwrap() ^= 0xff;
        assert!(receiver.open(&out, b"").is_none());
    }

    #[test]
    fn exact_replay_is_rejected() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        let mut out = Vec::new();
        sender.seal(b"hello world", b"", &mut out);
        assert!(receiver.open(&out, b"").is_some());
        assert!(receiver.open(&out, b"").is_none());
    }

    #[test]
    fn reordered_datagram_within_window_still_accepted_once() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        let mut first = Vec::new();
        let mut second = Vec::new();
        sender.seal(b"first", b"", &mut first);
        sender.seal(b"second", b"", &mut second);
        // second arrives before first, as UDP reordering would deliver it.
        assert_eq!(receiver.open(&second, b"").unwrap(), b"second");
        assert_eq!(receiver.open(&first, b"").unwrap(), b"first");
        // replaying either one now is rejected.
        assert!(receiver.open(&first, b"").is_none());
        assert!(receiver.open(&second, b"").is_none());
    }

    #[test]
    fn datagram_older_than_the_window_is_rejected() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        let mut stale = Vec::new();
        sender.seal(b"stale", b"", &mut stale);
        for _ in 0..(REPLAY_WINDOW_BITS as usize + 10) {
            let mut out = Vec::new();
            sender.seal(b"x", b"", &mut out);
            receiver.open(&out, b"").unwrap();
        }
        assert!(receiver.open(&stale, b"").is_none());
    }

    #[test]
    fn many_datagrams_in_sequence() {
        let mut sender = Aead::new(key());
        let mut receiver = Aead::new(key());
        for i in 0..1000u32 {
            let mut out = Vec::new();
            let msg = i.to_le_bytes();
            sender.seal(&msg, b"", &mut out);
            let plain = receiver.open(&out, b"").unwrap();
            assert_eq!(plain, msg);
        }
    }

    #[test]
    fn counter_reconstructs_across_wraparound_boundary() {
        assert_eq!(reconstruct_counter(5, (1 << 32) - 2), (1 << 32) + 5);
        assert_eq!(reconstruct_counter((1u32 << 31) + 5, 10), (1u32 << 31) as u64 + 5);
    }
}
