//! Sphynx: a connection-oriented, authenticated, encrypted message transport on top of UDP.
//!
//! See `addr`, `wire`, `crypto`, `cookie`, `connmap`, `handshake`, `transport`, `flow_control`
//! and `dispatcher` for the individual pieces; `server` and `client` are the embedding surface
//! applications use.

pub mod addr;
pub mod config;
pub mod connection;
pub mod connmap;
pub mod cookie;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod flow_control;
pub mod handshake;
pub mod logging;
pub mod sendbuf;
pub mod transport;
pub mod udp;
pub mod wire;
pub mod worker;

pub mod client;
pub mod server;

pub use client::Client;
pub use error::{Error, Result};
pub use server::Server;
