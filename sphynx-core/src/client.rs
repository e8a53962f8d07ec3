//! The `Client` embedding API: mirrors `Server` but for the single-connection side of the wire.
//! `Connect` blocks through the handshake, then hands back a `Client` wrapping the one
//! `Connection` it negotiated, plus a recv/tick thread pair driving it.
//!
//! Uses the same `ConnexionHandler` split `server.rs` does; a `Client` is simply the whole
//! connection with no server wrapped around it.

use crate::addr::NetAddr;
use crate::connection::{Connection, TICK_RATE_MS};
use crate::crypto::directional_keys;
use crate::crypto::keys::PUBLIC_KEY_BYTES;
use crate::error::{Error, Result};
use crate::handshake::{self, ClientError};
use crate::logging::{debug, info, Logger};
use crate::server::ConnexionHandler;
use crate::transport;
use crate::udp::UdpEndpoint;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HANDSHAKE_ATTEMPTS: u32 = 5;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Error {
        match e {
            ClientError::Timeout => Error::Io(std::io::ErrorKind::TimedOut),
            ClientError::OutOfMemory => Error::ResourceExhausted,
            ClientError::BrokenPipe => Error::Io(std::io::ErrorKind::BrokenPipe),
            ClientError::IcmpUnreachable => Error::Io(std::io::ErrorKind::ConnectionRefused),
        }
    }
}

/// Map a server-signaled `ERROR` reason onto the local error type the caller sees.
fn server_error_to_local(reason: u8) -> Error {
    match reason {
        handshake::ERR_WRONG_KEY | handshake::ERR_TAMPERING => Error::Tampering,
        handshake::ERR_SERVER_FULL | handshake::ERR_FLOOD_DETECTED => Error::ResourceExhausted,
        _ => Error::Io(std::io::ErrorKind::Other),
    }
}

struct ClientInner {
    conn: Arc<Connection>,
    socket: std::net::UdpSocket,
    server_addr: SocketAddr,
    handler: Arc<dyn ConnexionHandler>,
    shutting_down: AtomicBool,
    epoch: Instant,
    logger: Logger,
}

impl ClientInner {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// A connected client: the negotiated connection plus the background threads driving it.
pub struct Client {
    inner: Arc<ClientInner>,
    recv_thread: Option<std::thread::JoinHandle<()>>,
    tick_thread: Option<std::thread::JoinHandle<()>>,
}

impl Client {
    /// Perform the handshake and, on success, start the recv/tick threads. Blocks for up to
    /// `HANDSHAKE_ATTEMPTS * HANDSHAKE_TIMEOUT` waiting for each reply.
    pub fn connect(
        bind_addr: SocketAddr,
        server_addr: SocketAddr,
        expected_server_pubkey: [u8; PUBLIC_KEY_BYTES],
        preshared_session_key: [u8; 32],
        handler: Arc<dyn ConnexionHandler>,
        logger: Logger,
    ) -> Result<Client> {
        let mut endpoint = UdpEndpoint::bind(bind_addr, 0)?;

        let hello = handshake::client_hello(expected_server_pubkey);
        let cookie_reply =
            request_response(&mut endpoint, server_addr, &hello.encode(), HANDSHAKE_ATTEMPTS, HANDSHAKE_TIMEOUT)
                .ok_or(Error::from(ClientError::Timeout))?;
        let cookie = match handshake::Message::decode(&cookie_reply) {
            Some(handshake::Message::Cookie(c)) => c,
            Some(handshake::Message::Error(e)) => return Err(server_error_to_local(e.reason)),
            _ => return Err(Error::Tampering),
        };

        let (challenge_msg, ephemeral, _client_salt) = handshake::client_challenge(cookie.cookie);
        let challenge = match &challenge_msg {
            handshake::Message::Challenge(c) => *c,
            _ => unreachable!(),
        };
        let answer_reply = request_response(
            &mut endpoint,
            server_addr,
            &challenge_msg.encode(),
            HANDSHAKE_ATTEMPTS,
            HANDSHAKE_TIMEOUT,
        )
        .ok_or(Error::from(ClientError::Timeout))?;
        let answer = match handshake::Message::decode(&answer_reply) {
            Some(handshake::Message::Answer(a)) => a,
            Some(handshake::Message::Error(e)) => return Err(server_error_to_local(e.reason)),
            _ => return Err(Error::Tampering),
        };

        let session_key = handshake::client_verify_answer(
            &expected_server_pubkey,
            cookie.cookie,
            &challenge,
            &answer,
            &ephemeral,
            &preshared_session_key,
        )
        .ok_or(Error::Tampering)?;

        let (c2s, s2c) = directional_keys(&session_key);
        let remote = NetAddr::from_socket_addr(server_addr);
        let budget = transport::payload_budget(transport::MTU_MIN, remote.family());
        let now = 0;
        let conn = Arc::new(Connection::new(remote, 0, c2s, s2c, budget, now));
        conn.start_mtu_probe(now);

        info!(logger, "connected"; "server" => %server_addr);

        let socket = endpoint.try_clone()?;
        let inner = Arc::new(ClientInner {
            conn,
            socket,
            server_addr,
            handler,
            shutting_down: AtomicBool::new(false),
            epoch: Instant::now(),
            logger,
        });

        let recv_inner = inner.clone();
        let recv_thread = std::thread::spawn(move || Self::recv_loop(recv_inner, endpoint));
        let tick_inner = inner.clone();
        let tick_thread = std::thread::spawn(move || Self::tick_loop(tick_inner));

        inner.handler.on_connect(&inner.conn);

        Ok(Client {
            inner,
            recv_thread: Some(recv_thread),
            tick_thread: Some(tick_thread),
        })
    }

    pub fn rtt(&self) -> u32 {
        self.inner.conn.rtt()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.conn.is_disconnected()
    }

    pub fn write_reliable(&self, stream: u8, payload: &[u8]) {
        self.inner.conn.write_reliable(stream, crate::wire::SuperOpcode::Data, payload);
    }

    pub fn write_unreliable(&self, payload: &[u8]) {
        self.inner.conn.write_unreliable(payload);
    }

    /// Flush any queued messages immediately rather than waiting for the next tick.
    pub fn flush(&self) {
        let now = self.inner.now_ms();
        let mut out = Vec::new();
        self.inner.conn.flush_write(now, &mut out);
        for datagram in out {
            let _ = crate::udp::send_to_best_effort(&self.inner.socket, &datagram, self.inner.server_addr);
        }
    }

    pub fn disconnect(&self, reason: u8) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
        let now = self.inner.now_ms();
        let mut out = Vec::new();
        self.inner.conn.disconnect(reason, now, &mut out);
        for datagram in out {
            let _ = crate::udp::send_to_best_effort(&self.inner.socket, &datagram, self.inner.server_addr);
        }
    }

    pub fn join(mut self) {
        if let Some(t) = self.tick_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.recv_thread.take() {
            let _ = t.join();
        }
    }

    fn recv_loop(inner: Arc<ClientInner>, mut endpoint: UdpEndpoint) {
        loop {
            match endpoint.recv_batch(64) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(_) => {
                    let now = inner.now_ms();
                    let datagrams: Vec<(SocketAddr, Vec<u8>)> =
                        endpoint.batch().map(|d| (d.addr, d.bytes.to_vec())).collect();
                    for (addr, bytes) in datagrams {
                        if addr != inner.server_addr {
                            continue;
                        }
                        if let Some(result) = inner.conn.on_datagram(&bytes, now) {
                            if !result.messages.is_empty() {
                                inner.handler.on_messages(&inner.conn, &result.messages);
                            }
                            if let Some(reason) = result.disconnect_reason {
                                inner.handler.on_disconnect_reason(&inner.conn, reason);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(inner.logger, "recv_batch failed"; "error" => %e);
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if inner.conn.is_disconnected() {
                return;
            }
        }
    }

    fn tick_loop(inner: Arc<ClientInner>) {
        loop {
            std::thread::sleep(Duration::from_millis(TICK_RATE_MS as u64));
            let now = inner.now_ms();
            let mut out = Vec::new();
            let disco = inner.conn.tick(now, &mut out);
            for datagram in &out {
                let _ = crate::udp::send_to_best_effort(&inner.socket, datagram, inner.server_addr);
            }
            if let Some(reason) = disco {
                inner.handler.on_disconnect_reason(&inner.conn, reason);
                return;
            }
            inner.handler.on_tick(&inner.conn, now);
            if inner.conn.is_disconnected() {
                return;
            }
        }
    }
}

/// Send `payload` and poll for a reply from `server_addr`, retrying up to `attempts` times with
/// `timeout` between sends: client-side retransmission of `HELLO`/`CHALLENGE` while awaiting the
/// next message, using a fixed interval rather than an exponential backoff.
fn request_response(
    endpoint: &mut UdpEndpoint,
    server_addr: SocketAddr,
    payload: &[u8],
    attempts: u32,
    timeout: Duration,
) -> Option<Vec<u8>> {
    for _ in 0..attempts {
        if endpoint.send_to(payload, server_addr).is_err() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(n) = endpoint.recv_batch(16) {
                if n > 0 {
                    for d in endpoint.batch() {
                        if d.addr == server_addr {
                            return Some(d.bytes.to_vec());
                        }
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Context;
    use crate::crypto::keys::StaticKeyPair;
    use crate::logging;
    use crate::server::{Server, ServerHandler};

    struct NullHandler;
    impl ConnexionHandler for NullHandler {}

    struct EchoServerHandler;
    impl ServerHandler for EchoServerHandler {
        fn new_connexion(&self, _conn: &Arc<Connection>) -> Arc<dyn ConnexionHandler> {
            Arc::new(NullHandler)
        }
    }

    #[test]
    fn connect_completes_the_handshake_against_a_live_server() {
        let key_pair = StaticKeyPair::generate();
        let server_pubkey = key_pair.public_key();
        let session_key = [9u8; 32];

        let ctx = Context {
            port: 0,
            support_ipv6: false,
            kernel_receive_buffer_bytes: 0,
            worker_count: 2,
            key_pair,
            session_key,
            logger: logging::discard(),
        };
        let server = Server::start(&ctx, Arc::new(EchoServerHandler)).expect("server should start");
        let server_addr: SocketAddr = format!("127.0.0.1:{}", server.local_port()).parse().unwrap();

        let client = Client::connect(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            server_pubkey,
            session_key,
            Arc::new(NullHandler),
            logging::discard(),
        )
        .expect("handshake should succeed");

        assert!(!client.is_disconnected());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.connection_count(), 1);

        client.disconnect(crate::connection::DISCO_USER_EXIT);
        client.join();
        server.shutdown();
        server.join();
    }

    #[test]
    fn connect_to_nothing_times_out() {
        // Port 1 on loopback: nothing is listening, so every retry goes unanswered.
        let refused: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = Client::connect(
            "127.0.0.1:0".parse().unwrap(),
            refused,
            [0u8; PUBLIC_KEY_BYTES],
            [0u8; 32],
            Arc::new(NullHandler),
            logging::discard(),
        );
        assert!(result.is_err());
    }
}
