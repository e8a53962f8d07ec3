//! The `Server` embedding API: owns the listening socket, the connection map, the cookie jar
//! and the worker pool, and drives the recv/dispatch/tick loops that tie them together.
//!
//! The split between "own the socket and worker loop" (this module) and "hand the application
//! its callbacks" (`ConnexionHandler`/`ServerHandler`) keeps every connection pinned to one
//! worker thread for its whole lifetime. A thread-local scratch parameter threaded through every
//! callback has no idiomatic Rust equivalent here and is dropped (see `DESIGN.md`).

use crate::addr::NetAddr;
use crate::connection::{Connection, InMessage, TICK_RATE_MS};
use crate::connmap::{self, ConnectionMap};
use crate::cookie::CookieJar;
use crate::crypto::directional_keys;
use crate::crypto::keys::StaticKeyPair;
use crate::dispatcher::{Dispatcher, Routed};
use crate::error::{Error, Result};
use crate::handshake;
use crate::logging::{debug, info, o, warn, Logger};
use crate::transport;
use crate::udp::UdpEndpoint;
use crate::worker::WorkerPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-connection application callbacks. Every
/// method has a no-op default so an embedder only overrides what it needs.
pub trait ConnexionHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &Connection) {}
    fn on_messages(&self, _conn: &Connection, _messages: &[InMessage]) {}
    fn on_tick(&self, _conn: &Connection, _now: u32) {}
    fn on_disconnect_reason(&self, _conn: &Connection, _reason: u8) {}
}

/// Server-wide hooks: the `NewConnexion` factory and the `AcceptNewConnexion` policy gate.
pub trait ServerHandler: Send + Sync + 'static {
    /// Address-level admission policy, checked after the cookie/signature checks already done
    /// by the handshake responder's own denylist hook. Default: accept everyone.
    fn accept_new_connexion(&self, _addr: &NetAddr) -> bool {
        true
    }

    /// Build the per-connection application handler for a newly admitted connection.
    fn new_connexion(&self, conn: &Arc<Connection>) -> Arc<dyn ConnexionHandler>;
}

struct ServerInner {
    socket: UdpSocket,
    data_port: u16,
    conn_map: ConnectionMap,
    cookie_jar: Mutex<CookieJar>,
    key_pair: StaticKeyPair,
    session_key: [u8; 32],
    handlers: Mutex<HashMap<NetAddr, Arc<dyn ConnexionHandler>>>,
    handler: Arc<dyn ServerHandler>,
    workers: WorkerPool,
    dispatcher: Dispatcher,
    shutting_down: AtomicBool,
    epoch: Instant,
    logger: Logger,
}

impl ServerInner {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// A running Sphynx server: a bound UDP endpoint, its worker pool, and the recv/tick threads
/// driving them. Dropping this does not itself shut the server down gracefully — call
/// [`Server::shutdown`] first and wait for [`Server::join`] if a clean drain matters.
pub struct Server {
    inner: Arc<ServerInner>,
    recv_thread: Option<std::thread::JoinHandle<()>>,
    tick_thread: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    /// Bind and start serving. `handler` supplies
    /// the per-server and per-connection callbacks.
    pub fn start(ctx: &crate::config::Context, handler: Arc<dyn ServerHandler>) -> Result<Server> {
        let bind_addr: SocketAddr = if ctx.support_ipv6 {
            format!("[::]:{}", ctx.port).parse().map_err(|_| Error::AddrParse)?
        } else {
            format!("0.0.0.0:{}", ctx.port).parse().map_err(|_| Error::AddrParse)?
        };

        let mut endpoint = UdpEndpoint::bind(bind_addr, ctx.kernel_receive_buffer_bytes)?;
        let send_socket = endpoint.try_clone()?;
        let local_addr = endpoint.local_addr()?;

        info!(ctx.logger, "server listening"; "addr" => %local_addr);

        let inner = Arc::new(ServerInner {
            socket: send_socket,
            data_port: local_addr.port(),
            conn_map: ConnectionMap::new(),
            cookie_jar: Mutex::new(CookieJar::new()),
            key_pair: StaticKeyPair::from_seed(*ctx.key_pair.seed()),
            session_key: ctx.session_key,
            handlers: Mutex::new(HashMap::new()),
            handler,
            workers: WorkerPool::new(ctx.worker_count),
            dispatcher: Dispatcher::new(),
            shutting_down: AtomicBool::new(false),
            epoch: Instant::now(),
            logger: ctx.logger.new(o!("component" => "server")),
        });

        let recv_inner = inner.clone();
        let recv_thread = std::thread::spawn(move || Self::recv_loop(recv_inner, endpoint));

        let tick_inner = inner.clone();
        let tick_thread = std::thread::spawn(move || Self::tick_loop(tick_inner));

        Ok(Server {
            inner,
            recv_thread: Some(recv_thread),
            tick_thread: Some(tick_thread),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.data_port
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conn_map.len()
    }

    /// Begin the shutdown sequence: stop admitting new connections, reply `ERROR` to
    /// `CHALLENGE`s already in flight, and ask every open connection to disconnect on its next
    /// tick. Returns immediately; the tick thread drains and exits once every connection has
    /// closed.
    pub fn shutdown(&self) {
        info!(self.inner.logger, "shutdown requested");
        self.inner.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Block until the tick thread has drained every connection and the recv thread has exited.
    /// Only returns once [`Server::shutdown`] has been called.
    pub fn join(mut self) {
        if let Some(t) = self.tick_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.recv_thread.take() {
            let _ = t.join();
        }
    }

    fn recv_loop(inner: Arc<ServerInner>, mut endpoint: UdpEndpoint) {
        const MAX_BATCH: usize = 1024;
        loop {
            match endpoint.recv_batch(MAX_BATCH) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(_) => {
                    let datagrams: Vec<(NetAddr, Vec<u8>)> = endpoint
                        .batch()
                        .map(|d| (NetAddr::from_socket_addr(d.addr), d.bytes.to_vec()))
                        .collect();
                    let batch = inner
                        .dispatcher
                        .dispatch_batch(&inner.conn_map, inner.workers.worker_count(), datagrams);
                    if batch.flooded > 0 {
                        debug!(inner.logger, "dropped flooded datagrams"; "count" => batch.flooded);
                    }
                    for (worker_id, bin) in batch.bins.into_iter().enumerate() {
                        if bin.is_empty() {
                            continue;
                        }
                        let job_inner = inner.clone();
                        inner.workers.submit(Box::new(move || {
                            Self::process_bin(job_inner, worker_id, bin);
                        }));
                    }
                }
                Err(e) => {
                    warn!(inner.logger, "recv_batch failed"; "error" => %e);
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if inner.shutting_down.load(Ordering::Relaxed) && inner.conn_map.is_empty() {
                return;
            }
        }
    }

    fn process_bin(inner: Arc<ServerInner>, worker_id: usize, bin: Vec<Routed>) {
        let now = inner.now_ms();
        let mut by_conn: HashMap<NetAddr, (Arc<Connection>, Vec<InMessage>, Option<u8>)> = HashMap::new();
        let mut wire_out: Vec<(SocketAddr, Vec<u8>)> = Vec::new();

        for routed in bin {
            match routed {
                Routed::ToConnection(conn, bytes) => match conn.on_datagram(&bytes, now) {
                    Some(result) => {
                        let entry = by_conn
                            .entry(conn.remote_addr)
                            .or_insert_with(|| (conn.clone(), Vec::new(), None));
                        entry.1.extend(result.messages);
                        if result.disconnect_reason.is_some() {
                            entry.2 = result.disconnect_reason;
                        }
                    }
                    None => {
                        if let Some(answer_bytes) = conn.maybe_retransmit_answer(&bytes) {
                            wire_out.push((conn.remote_addr.to_socket_addr(), answer_bytes));
                        }
                        // Otherwise a datagram failed to authenticate: silent drop.
                    }
                },
                Routed::Handshake(addr, bytes) => {
                    Self::handle_handshake_datagram(&inner, worker_id, addr, &bytes, now, &mut wire_out);
                }
            }
        }

        for (addr, (conn, messages, disconnect_reason)) in by_conn {
            if !messages.is_empty() {
                if let Some(handler) = inner.handlers.lock().get(&addr).cloned() {
                    handler.on_messages(&conn, &messages);
                }
            }
            if let Some(reason) = disconnect_reason {
                if let Some(handler) = inner.handlers.lock().remove(&addr) {
                    handler.on_disconnect_reason(&conn, reason);
                }
                inner.conn_map.remove(&addr);
            } else {
                let mut datagrams = Vec::new();
                conn.flush_write(now, &mut datagrams);
                for datagram in datagrams {
                    wire_out.push((addr.to_socket_addr(), datagram));
                }
            }
        }

        for (addr, bytes) in wire_out {
            let _ = crate::udp::send_to_best_effort(&inner.socket, &bytes, addr);
        }
    }

    fn handle_handshake_datagram(
        inner: &Arc<ServerInner>,
        worker_id: usize,
        addr: NetAddr,
        bytes: &[u8],
        now: u32,
        wire_out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let msg = match handshake::Message::decode(bytes) {
            Some(m) => m,
            None => return,
        };
        let responder = handshake::Responder::new(&inner.key_pair, inner.session_key);

        match msg {
            handshake::Message::Hello(hello) => {
                if inner.shutting_down.load(Ordering::Relaxed) {
                    return; // stop admitting new handshakes during shutdown
                }
                let jar = inner.cookie_jar.lock();
                match responder.on_hello(&hello, &jar, &addr) {
                    handshake::Action::Send(reply) => wire_out.push((addr.to_socket_addr(), reply.encode())),
                    handshake::Action::Drop => {}
                    handshake::Action::Admit { .. } => unreachable!("on_hello never admits"),
                }
            }
            handshake::Message::Challenge(challenge) => {
                if inner.shutting_down.load(Ordering::Relaxed) {
                    let err = handshake::Message::Error(handshake::HandshakeError {
                        reason: handshake::ERR_SHUTTING_DOWN,
                    });
                    wire_out.push((addr.to_socket_addr(), err.encode()));
                    return;
                }
                if !inner.handler.accept_new_connexion(&addr) {
                    return; // denylisted: silent drop, same as a failed cookie check
                }

                let population = inner.conn_map.len();
                let action = {
                    let jar = inner.cookie_jar.lock();
                    responder.on_challenge(
                        &challenge,
                        &jar,
                        &addr,
                        population,
                        connmap::MAX_POPULATION,
                        false,
                        false,
                        inner.data_port,
                    )
                };

                match action {
                    handshake::Action::Drop => {}
                    handshake::Action::Send(reply) => wire_out.push((addr.to_socket_addr(), reply.encode())),
                    handshake::Action::Admit { answer, session_key, challenge_bytes } => {
                        let (c2s, s2c) = directional_keys(&session_key);
                        let budget = transport::payload_budget(transport::MTU_MIN, addr.family());
                        let conn = Arc::new(Connection::new(addr, worker_id, s2c, c2s, budget, now));
                        let answer_bytes = handshake::Message::Answer(answer).encode();
                        conn.cache_handshake_answer(challenge_bytes, answer_bytes.clone());

                        if !inner.conn_map.insert(addr, conn.clone()) {
                            return; // lost the race for the last population slot
                        }
                        let conn_handler = inner.handler.new_connexion(&conn);
                        inner.handlers.lock().insert(addr, conn_handler.clone());
                        conn_handler.on_connect(&conn);

                        info!(inner.logger, "connection admitted"; "addr" => %addr, "worker" => worker_id);
                        wire_out.push((addr.to_socket_addr(), answer_bytes));
                    }
                }
            }
            handshake::Message::Cookie(_) | handshake::Message::Answer(_) | handshake::Message::Error(_) => {
                // These only ever travel server-to-client; a server receiving one is either
                // misdirected or a confused peer. Silently dropped.
            }
        }
    }

    fn tick_loop(inner: Arc<ServerInner>) {
        loop {
            std::thread::sleep(Duration::from_millis(TICK_RATE_MS as u64));
            let now = inner.now_ms();
            inner.cookie_jar.lock().maybe_rotate(Instant::now());
            let shutting_down = inner.shutting_down.load(Ordering::Relaxed);

            let mut to_remove = Vec::new();
            for conn in inner.conn_map.iter() {
                let mut out = Vec::new();
                if shutting_down && !conn.is_disconnected() {
                    conn.disconnect(crate::connection::DISCO_SHUTDOWN, now, &mut out);
                }
                let disco = conn.tick(now, &mut out);

                if let Some(reason) = disco {
                    if let Some(handler) = inner.handlers.lock().get(&conn.remote_addr).cloned() {
                        handler.on_disconnect_reason(&conn, reason);
                    }
                    to_remove.push(conn.remote_addr);
                } else {
                    if let Some(handler) = inner.handlers.lock().get(&conn.remote_addr).cloned() {
                        handler.on_tick(&conn, now);
                    }
                    if conn.is_disconnected() {
                        to_remove.push(conn.remote_addr);
                    }
                }

                for datagram in out {
                    let _ = crate::udp::send_to_best_effort(&inner.socket, &datagram, conn.remote_addr.to_socket_addr());
                }
            }

            for addr in &to_remove {
                inner.conn_map.remove(addr);
                inner.handlers.lock().remove(addr);
            }

            if shutting_down && inner.conn_map.is_empty() {
                info!(inner.logger, "shutdown complete");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        connects: AtomicUsize,
    }

    impl ConnexionHandler for CountingHandler {
        fn on_connect(&self, _conn: &Connection) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestServerHandler {
        connects: Arc<AtomicUsize>,
    }

    impl ServerHandler for TestServerHandler {
        fn new_connexion(&self, _conn: &Arc<Connection>) -> Arc<dyn ConnexionHandler> {
            Arc::new(CountingHandler {
                connects: AtomicUsize::new(0),
            })
        }
    }

    fn test_context(port: u16) -> crate::config::Context {
        crate::config::Context {
            port,
            support_ipv6: false,
            kernel_receive_buffer_bytes: 0,
            worker_count: 2,
            key_pair: StaticKeyPair::generate(),
            session_key: [3u8; 32],
            logger: logging::discard(),
        }
    }

    #[test]
    fn start_binds_an_ephemeral_port_and_shuts_down_cleanly() {
        let handler = Arc::new(TestServerHandler {
            connects: Arc::new(AtomicUsize::new(0)),
        });
        let server = Server::start(&test_context(0), handler).expect("server should start");
        assert_ne!(server.local_port(), 0);
        assert_eq!(server.connection_count(), 0);
        server.shutdown();
        server.join();
    }

    #[test]
    fn full_handshake_admits_a_client_connection() {
        let handler = Arc::new(TestServerHandler {
            connects: Arc::new(AtomicUsize::new(0)),
        });
        let server = Server::start(&test_context(0), handler).expect("server should start");
        let server_addr: SocketAddr = format!("127.0.0.1:{}", server.local_port()).parse().unwrap();

        let server_pubkey = {
            // The server generated its own key pair inside `start`; recover its public half the
            // same way a real deployment would — by reading back the persisted file. Here we
            // instead just re-derive from the same seed the test context handed in, since
            // `start` makes its own independent `StaticKeyPair` copy from that seed.
            server.inner.key_pair.public_key()
        };

        let mut client = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let hello = handshake::client_hello(server_pubkey);
        client.send_to(&hello.encode(), server_addr).unwrap();

        let cookie = recv_one(&mut client, server_addr, Duration::from_millis(500))
            .and_then(|bytes| handshake::Message::decode(&bytes))
            .expect("expected a COOKIE reply");
        let cookie = match cookie {
            handshake::Message::Cookie(c) => c,
            other => panic!("expected Cookie, got {:?}", other),
        };

        let (challenge_msg, ephemeral, _salt) = handshake::client_challenge(cookie.cookie);
        let challenge = match &challenge_msg {
            handshake::Message::Challenge(c) => *c,
            _ => unreachable!(),
        };
        client.send_to(&challenge_msg.encode(), server_addr).unwrap();

        let answer = recv_one(&mut client, server_addr, Duration::from_millis(500))
            .and_then(|bytes| handshake::Message::decode(&bytes))
            .expect("expected an ANSWER reply");
        let answer = match answer {
            handshake::Message::Answer(a) => a,
            other => panic!("expected Answer, got {:?}", other),
        };

        let session_key = handshake::client_verify_answer(
            &server_pubkey,
            cookie.cookie,
            &challenge,
            &answer,
            &ephemeral,
            &[3u8; 32],
        )
        .expect("answer should verify");
        let _ = session_key;

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        server.join();
    }

    fn recv_one(endpoint: &mut UdpEndpoint, from: SocketAddr, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(n) = endpoint.recv_batch(8) {
                if n > 0 {
                    for d in endpoint.batch() {
                        if d.addr == from {
                            return Some(d.bytes.to_vec());
                        }
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }
}
