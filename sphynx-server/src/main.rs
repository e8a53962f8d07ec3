//! Standalone Sphynx server binary: loads the persisted key-pair and session-key files, boots the
//! transport core's `Server`, and echoes received reliable messages back to their sender on the
//! same stream until interrupted.
//!
//! `clap` for args, a config file loaded up front, the logger set up before doing anything else.

use clap::{App, Arg};
use sloggers::types::Severity;
use sphynx_core::config::{Context, ServerConfig};
use sphynx_core::connection::{Connection, InMessage};
use sphynx_core::crypto::keys::StaticKeyPair;
use sphynx_core::logging::{self, info, warn};
use sphynx_core::server::{ConnexionHandler, Server, ServerHandler};
use sphynx_core::wire::SuperOpcode;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct EchoHandler {
    addr: sphynx_core::addr::NetAddr,
}

impl ConnexionHandler for EchoHandler {
    fn on_messages(&self, conn: &Connection, messages: &[InMessage]) {
        for msg in messages {
            conn.write_reliable(msg.stream, SuperOpcode::Data, &msg.payload);
        }
    }

    fn on_disconnect_reason(&self, _conn: &Connection, reason: u8) {
        eprintln!("connection {} disconnected: reason={:#x}", self.addr, reason);
    }
}

struct EchoServer;

impl ServerHandler for EchoServer {
    fn new_connexion(&self, conn: &Arc<Connection>) -> Arc<dyn ConnexionHandler> {
        Arc::new(EchoHandler { addr: conn.remote_addr })
    }
}

fn load_session_key(path: &str) -> [u8; 32] {
    let bytes = fs::read(path).unwrap_or_else(|err| {
        eprintln!("error reading session key file `{}`: {}", path, err);
        std::process::exit(1);
    });
    if bytes.len() != 32 {
        eprintln!("session key file `{}` is {} bytes, expected 32", path, bytes.len());
        std::process::exit(1);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    key
}

fn load_key_pair(path: &str) -> StaticKeyPair {
    let bytes = fs::read(path).unwrap_or_else(|err| {
        eprintln!("error reading key-pair file `{}`: {}", path, err);
        std::process::exit(1);
    });
    StaticKeyPair::load_bytes(&bytes).unwrap_or_else(|err| {
        eprintln!("key-pair file `{}` is corrupt: {}", path, err);
        std::process::exit(1);
    })
}

fn main() {
    let matches = App::new("Sphynx Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs a standalone Sphynx transport server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the server's TOML config file")
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug severity instead of info"),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = ServerConfig::load(config_file_path);

    let severity = if matches.is_present("verbose") { Severity::Debug } else { Severity::Info };
    let logger = logging::init_terminal(severity);

    let key_pair = load_key_pair(&config.key_file);
    let session_key = load_session_key(&config.session_key_file);

    let ctx = Context::from_config(&config, key_pair, session_key, logger.clone());

    info!(logger, "starting sphynx-server"; "port" => ctx.port, "workers" => ctx.worker_count);

    let server = Server::start(&ctx, Arc::new(EchoServer)).unwrap_or_else(|err| {
        eprintln!("failed to start server: {:?}", err);
        std::process::exit(1);
    });

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let stdin_flag = shutdown_requested.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        let mut buf = [0u8; 1];
        while let Ok(n) = std::io::stdin().read(&mut buf) {
            if n == 0 {
                break;
            }
        }
        stdin_flag.store(true, Ordering::SeqCst);
    });

    while !shutdown_requested.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    warn!(logger, "shutdown signal received, draining connections");
    server.shutdown();
    server.join();
}
