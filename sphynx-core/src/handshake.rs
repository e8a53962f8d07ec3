//! Handshake state machine: the four-message `HELLO`/`COOKIE`/`CHALLENGE`/`ANSWER` exchange that
//! admits a client and installs an authenticated-encryption context, plus the concrete
//! key-exchange instantiation.
//!
//! The server's per-address state machine (*None* → *CookieIssued* → *Authenticated*) needs no
//! storage of its own: the cookie jar is stateless, so `CookieIssued` is encoded entirely in the
//! cookie the client carries back in `CHALLENGE`, and `Authenticated` is just "a `Connection` now
//! exists in the connection map" — one obvious place for the data to live rather than a parallel
//! bookkeeping table, matching `cookie.rs`'s "validated without per-client state" design.

use crate::cookie::CookieJar;
use crate::crypto::keys::{self, StaticKeyPair, PUBLIC_KEY_BYTES};
use crate::crypto::kx::EphemeralKeyPair;

pub const MAGIC: u32 = 0xC47D_0001;

pub const OPCODE_HELLO: u8 = 0;
pub const OPCODE_COOKIE: u8 = 1;
pub const OPCODE_CHALLENGE: u8 = 2;
pub const OPCODE_ANSWER: u8 = 3;
pub const OPCODE_ERROR: u8 = 4;

pub const ERR_WRONG_KEY: u8 = 0x7f;
pub const ERR_SERVER_FULL: u8 = 0xa6;
pub const ERR_FLOOD_DETECTED: u8 = 0x40;
pub const ERR_TAMPERING: u8 = 0xcc;
pub const ERR_SERVER_ERROR: u8 = 0x1f;
/// Not one of the named admission-reason list; added for the shutdown behavior
/// ("sends `ERROR/shutting-down` to any `CHALLENGE` in flight"), using a reason byte none of the
/// five named reasons occupy.
pub const ERR_SHUTTING_DOWN: u8 = 0x5d;

/// Local-only (never travels on the wire) reasons a client's handshake attempt can fail, per
/// Synthesized for out-of-memory, broken-pipe, timeout, ICMP-unreachable — never travel on
/// the wire themselves.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientError {
    Timeout,
    OutOfMemory,
    BrokenPipe,
    IcmpUnreachable,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Hello {
    pub expected_server_pubkey: [u8; PUBLIC_KEY_BYTES],
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CookieMsg {
    pub cookie: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Challenge {
    pub cookie: u32,
    pub client_ephemeral_pk: [u8; 32],
    pub client_salt: [u8; 32],
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Answer {
    pub data_port: u16,
    pub server_ephemeral_pk: [u8; 32],
    pub signature: [u8; 64],
    pub server_salt: [u8; 32],
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandshakeError {
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Message {
    Hello(Hello),
    Cookie(CookieMsg),
    Challenge(Challenge),
    Answer(Answer),
    Error(HandshakeError),
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().expect("4 bytes"))
}

impl Message {
    /// Parse a raw handshake datagram. Returns `None` on any structural problem, including a
    /// magic mismatch — both are treated as a silent drop, so callers never need to
    /// distinguish "malformed" from "not for us".
    pub fn decode(buf: &[u8]) -> Option<Message> {
        if buf.is_empty() {
            return None;
        }
        let (opcode, body) = (buf[0], &buf[1..]);
        match opcode {
            OPCODE_HELLO if body.len() == 4 + PUBLIC_KEY_BYTES => {
                if read_u32_le(body) != MAGIC {
                    return None;
                }
                let mut key = [0u8; PUBLIC_KEY_BYTES];
                key.copy_from_slice(&body[4..]);
                Some(Message::Hello(Hello { expected_server_pubkey: key }))
            }
            OPCODE_COOKIE if body.len() == 4 => Some(Message::Cookie(CookieMsg { cookie: read_u32_le(body) })),
            OPCODE_CHALLENGE if body.len() == 4 + 4 + 64 => {
                if read_u32_le(body) != MAGIC {
                    return None;
                }
                let cookie = read_u32_le(&body[4..]);
                let mut client_ephemeral_pk = [0u8; 32];
                client_ephemeral_pk.copy_from_slice(&body[8..40]);
                let mut client_salt = [0u8; 32];
                client_salt.copy_from_slice(&body[40..72]);
                Some(Message::Challenge(Challenge {
                    cookie,
                    client_ephemeral_pk,
                    client_salt,
                }))
            }
            OPCODE_ANSWER if body.len() == 2 + 128 => {
                let data_port = u16::from_le_bytes([body[0], body[1]]);
                let mut server_ephemeral_pk = [0u8; 32];
                server_ephemeral_pk.copy_from_slice(&body[2..34]);
                let mut signature = [0u8; 64];
                signature.copy_from_slice(&body[34..98]);
                let mut server_salt = [0u8; 32];
                server_salt.copy_from_slice(&body[98..130]);
                Some(Message::Answer(Answer {
                    data_port,
                    server_ephemeral_pk,
                    signature,
                    server_salt,
                }))
            }
            OPCODE_ERROR if body.len() == 1 => Some(Message::Error(HandshakeError { reason: body[0] })),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Hello(h) => {
                out.push(OPCODE_HELLO);
                out.extend_from_slice(&MAGIC.to_le_bytes());
                out.extend_from_slice(&h.expected_server_pubkey);
            }
            Message::Cookie(c) => {
                out.push(OPCODE_COOKIE);
                out.extend_from_slice(&c.cookie.to_le_bytes());
            }
            Message::Challenge(c) => {
                out.push(OPCODE_CHALLENGE);
                out.extend_from_slice(&MAGIC.to_le_bytes());
                out.extend_from_slice(&c.cookie.to_le_bytes());
                out.extend_from_slice(&c.client_ephemeral_pk);
                out.extend_from_slice(&c.client_salt);
            }
            Message::Answer(a) => {
                out.push(OPCODE_ANSWER);
                out.extend_from_slice(&a.data_port.to_le_bytes());
                out.extend_from_slice(&a.server_ephemeral_pk);
                out.extend_from_slice(&a.signature);
                out.extend_from_slice(&a.server_salt);
            }
            Message::Error(e) => {
                out.push(OPCODE_ERROR);
                out.push(e.reason);
            }
        }
        out
    }
}

/// Raw bytes of a `CHALLENGE`'s 64-byte payload, as compared against a connection's cached first
/// challenge, so a lost `ANSWER` can be retransmitted if an identical `CHALLENGE` arrives again.
impl Challenge {
    pub fn challenge_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.client_ephemeral_pk);
        out[32..].copy_from_slice(&self.client_salt);
        out
    }
}

/// Transcript signed in `ANSWER`: binds the server's identity, the client's
/// claimed expectation of it, the cookie, the full challenge and the server's own ephemeral
/// contribution, so a replayed or mixed-and-matched handshake message can't be passed off as a
/// fresh one.
fn transcript(
    server_pubkey: &[u8; PUBLIC_KEY_BYTES],
    cookie: u32,
    challenge: &Challenge,
    server_ephemeral_pk: &[u8; 32],
    server_salt: &[u8; 32],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(PUBLIC_KEY_BYTES + 4 + 64 + 32 + 32);
    t.extend_from_slice(server_pubkey);
    t.extend_from_slice(&cookie.to_le_bytes());
    t.extend_from_slice(&challenge.challenge_bytes());
    t.extend_from_slice(server_ephemeral_pk);
    t.extend_from_slice(server_salt);
    t
}

/// Everything the server side of the handshake needs: its static identity, the cookie jar, and
/// the out-of-band pre-shared session key (§B).
pub struct Responder<'a> {
    pub key_pair: &'a StaticKeyPair,
    pub preshared_session_key: [u8; 32],
}

/// What a connectionless datagram handler should do in response to one handshake message.
pub enum Action {
    Drop,
    Send(Message),
    /// A `CHALLENGE` was admitted: install a new connection with this session key, and send
    /// `answer` (cache both `challenge_bytes` and the encoded answer on the new connection so a
    /// lost `ANSWER` can be retransmitted byte-for-byte).
    Admit {
        answer: Answer,
        session_key: [u8; 32],
        challenge_bytes: [u8; 64],
    },
}

impl<'a> Responder<'a> {
    pub fn new(key_pair: &'a StaticKeyPair, preshared_session_key: [u8; 32]) -> Responder<'a> {
        Responder { key_pair, preshared_session_key }
    }

    /// Admission policy, in order: magic mismatch is handled by `Message::decode`
    /// already returning `None` before this is ever called.
    pub fn on_hello(&self, hello: &Hello, cookie_jar: &CookieJar, addr: &crate::addr::NetAddr) -> Action {
        if hello.expected_server_pubkey != self.key_pair.public_key() {
            return Action::Send(Message::Error(HandshakeError { reason: ERR_WRONG_KEY }));
        }
        Action::Send(Message::Cookie(CookieMsg { cookie: cookie_jar.generate(addr) }))
    }

    /// `population` is the connection map's current count (before this admission);
    /// `max_population` is the connection map's admission cap. `denylisted` is the address-denylist
    /// hook's verdict. `data_port` is this server's advertised data-plane UDP port.
    #[allow(clippy::too_many_arguments)]
    pub fn on_challenge(
        &self,
        challenge: &Challenge,
        cookie_jar: &CookieJar,
        addr: &crate::addr::NetAddr,
        population: usize,
        max_population: usize,
        flooded: bool,
        denylisted: bool,
        data_port: u16,
    ) -> Action {
        if flooded {
            return Action::Drop;
        }
        if !cookie_jar.verify(addr, challenge.cookie) {
            return Action::Drop; // stale cookie: silent drop
        }
        if population >= max_population {
            return Action::Send(Message::Error(HandshakeError { reason: ERR_SERVER_FULL }));
        }
        if denylisted {
            return Action::Drop;
        }

        let server_ephemeral = EphemeralKeyPair::generate();
        let shared = match server_ephemeral.shared_secret(&challenge.client_ephemeral_pk) {
            Some(s) => s,
            None => return Action::Send(Message::Error(HandshakeError { reason: ERR_TAMPERING })),
        };

        let mut server_salt = [0u8; 32];
        crate::crypto::random_bytes(&mut server_salt);

        let session_key = crate::crypto::derive_session_key(
            &shared,
            &challenge.client_salt,
            &server_salt,
            &self.preshared_session_key,
        );

        let t = transcript(
            &self.key_pair.public_key(),
            challenge.cookie,
            challenge,
            server_ephemeral.public(),
            &server_salt,
        );
        let signature = self.key_pair.sign(&t);

        let answer = Answer {
            data_port,
            server_ephemeral_pk: *server_ephemeral.public(),
            signature,
            server_salt,
        };

        Action::Admit {
            answer,
            session_key,
            challenge_bytes: challenge.challenge_bytes(),
        }
    }
}

/// Client side: build the initial `HELLO`.
pub fn client_hello(expected_server_pubkey: [u8; PUBLIC_KEY_BYTES]) -> Message {
    Message::Hello(Hello { expected_server_pubkey })
}

/// Client side: having received `COOKIE`, generate a fresh ephemeral key pair and build
/// `CHALLENGE`. The returned `EphemeralKeyPair` must be retained to derive the session key once
/// `ANSWER` arrives.
pub fn client_challenge(cookie: u32) -> (Message, EphemeralKeyPair, [u8; 32]) {
    let ephemeral = EphemeralKeyPair::generate();
    let mut salt = [0u8; 32];
    crate::crypto::random_bytes(&mut salt);
    let msg = Message::Challenge(Challenge {
        cookie,
        client_ephemeral_pk: *ephemeral.public(),
        client_salt: salt,
    });
    (msg, ephemeral, salt)
}

/// Client side: verify `ANSWER`'s signature against the server's expected long-term public key
/// and derive the session key. Returns `None` on any verification failure (treated as tampering
/// by the caller).
pub fn client_verify_answer(
    expected_server_pubkey: &[u8; PUBLIC_KEY_BYTES],
    cookie: u32,
    challenge: &Challenge,
    answer: &Answer,
    client_ephemeral: &EphemeralKeyPair,
    preshared_session_key: &[u8; 32],
) -> Option<[u8; 32]> {
    let t = transcript(expected_server_pubkey, cookie, challenge, &answer.server_ephemeral_pk, &answer.server_salt);
    if !keys::verify(expected_server_pubkey, &t, &answer.signature) {
        return None;
    }
    let shared = client_ephemeral.shared_secret(&answer.server_ephemeral_pk)?;
    Some(crate::crypto::derive_session_key(
        &shared,
        &challenge.client_salt,
        &answer.server_salt,
        preshared_session_key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NetAddr;
    use std::net::SocketAddr;

    fn addr() -> NetAddr {
        NetAddr::from_socket_addr("127.0.0.1:9000".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn message_roundtrip() {
        let hello = Message::Hello(Hello { expected_server_pubkey: [7u8; PUBLIC_KEY_BYTES] });
        assert_eq!(Message::decode(&hello.encode()), Some(hello));

        let cookie = Message::Cookie(CookieMsg { cookie: 0xdeadbeef });
        assert_eq!(Message::decode(&cookie.encode()), Some(cookie));

        let err = Message::Error(HandshakeError { reason: ERR_SERVER_FULL });
        assert_eq!(Message::decode(&err.encode()), Some(err));
    }

    #[test]
    fn bad_magic_is_silently_dropped() {
        let mut bytes = Message::Hello(Hello { expected_server_pubkey: [1u8; PUBLIC_KEY_BYTES] }).encode();
        bytes[1] ^= 0xff;
        assert_eq!(Message::decode(&bytes), None);
    }

    #[test]
    fn happy_path_handshake() {
        let server_keys = StaticKeyPair::generate();
        let preshared = [5u8; 32];
        let jar = CookieJar::new();
        let a = addr();

        let hello = client_hello(server_keys.public_key());
        let responder = Responder::new(&server_keys, preshared);
        let hello = match hello {
            Message::Hello(h) => h,
            _ => unreachable!(),
        };
        let cookie = match responder.on_hello(&hello, &jar, &a) {
            Action::Send(Message::Cookie(c)) => c,
            _ => panic!("expected cookie"),
        };

        let (challenge_msg, client_ephemeral, _salt) = client_challenge(cookie.cookie);
        let challenge = match challenge_msg {
            Message::Challenge(c) => c,
            _ => unreachable!(),
        };

        let action = responder.on_challenge(&challenge, &jar, &a, 0, 100, false, false, 9001);
        let (answer, server_session_key) = match action {
            Action::Admit { answer, session_key, .. } => (answer, session_key),
            _ => panic!("expected admission"),
        };

        let client_session_key = client_verify_answer(
            &server_keys.public_key(),
            challenge.cookie,
            &challenge,
            &answer,
            &client_ephemeral,
            &preshared,
        )
        .expect("answer should verify");

        assert_eq!(client_session_key, server_session_key);
    }

    #[test]
    fn wrong_expected_pubkey_is_refused() {
        let server_keys = StaticKeyPair::generate();
        let responder = Responder::new(&server_keys, [0u8; 32]);
        let jar = CookieJar::new();
        let hello = Hello { expected_server_pubkey: [0xffu8; PUBLIC_KEY_BYTES] };
        match responder.on_hello(&hello, &jar, &addr()) {
            Action::Send(Message::Error(e)) => assert_eq!(e.reason, ERR_WRONG_KEY),
            _ => panic!("expected wrong-key error"),
        }
    }

    #[test]
    fn stale_cookie_is_dropped() {
        let server_keys = StaticKeyPair::generate();
        let responder = Responder::new(&server_keys, [0u8; 32]);
        let jar = CookieJar::new();
        let (challenge_msg, _e, _s) = client_challenge(0xffff_ffff);
        let challenge = match challenge_msg {
            Message::Challenge(c) => c,
            _ => unreachable!(),
        };
        assert!(matches!(
            responder.on_challenge(&challenge, &jar, &addr(), 0, 100, false, false, 9001),
            Action::Drop
        ));
    }

    #[test]
    fn server_full_is_reported() {
        let server_keys = StaticKeyPair::generate();
        let responder = Responder::new(&server_keys, [0u8; 32]);
        let jar = CookieJar::new();
        let cookie = jar.generate(&addr());
        let (challenge_msg, _e, _s) = client_challenge(cookie);
        let challenge = match challenge_msg {
            Message::Challenge(c) => c,
            _ => unreachable!(),
        };
        match responder.on_challenge(&challenge, &jar, &addr(), 100, 100, false, false, 9001) {
            Action::Send(Message::Error(e)) => assert_eq!(e.reason, ERR_SERVER_FULL),
            _ => panic!("expected server-full error"),
        }
    }

    #[test]
    fn server_full_takes_precedence_over_denylisted() {
        // Population is checked before the denylist (spec order 3 then 4): a request that is
        // both over-population and denylisted gets ERR_SERVER_FULL, not a silent drop.
        let server_keys = StaticKeyPair::generate();
        let responder = Responder::new(&server_keys, [0u8; 32]);
        let jar = CookieJar::new();
        let cookie = jar.generate(&addr());
        let (challenge_msg, _e, _s) = client_challenge(cookie);
        let challenge = match challenge_msg {
            Message::Challenge(c) => c,
            _ => unreachable!(),
        };
        match responder.on_challenge(&challenge, &jar, &addr(), 100, 100, false, true, 9001) {
            Action::Send(Message::Error(e)) => assert_eq!(e.reason, ERR_SERVER_FULL),
            _ => panic!("expected server-full error to take precedence over the denylist"),
        }
    }
}
