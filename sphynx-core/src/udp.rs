//! Bound, non-blocking UDP socket exposing batched recv/send with a reusable receive buffer
//! drained on each poll, adapted from TCP-stream channel push/pull/sync handling to a single UDP
//! socket. Kernel receive-buffer tuning goes through `socket2`, since `std` exposes no
//! socket-option setter for it.

use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

pub const MAX_DATAGRAM_BYTES: usize = crate::transport::MTU_MAX as usize;

/// One inbound datagram plus its source address, borrowed from the endpoint's batch buffer.
pub struct RecvDatagram<'a> {
    pub addr: SocketAddr,
    pub bytes: &'a [u8],
}

/// A bound, non-blocking UDP socket with a reusable receive buffer for batched polling. The
/// dispatcher drains one batch per wake-up rather than processing a datagram at a time.
pub struct UdpEndpoint {
    socket: UdpSocket,
    batch: Vec<(SocketAddr, Vec<u8>)>,
}

impl UdpEndpoint {
    pub fn bind(addr: SocketAddr, kernel_receive_buffer_bytes: u32) -> io::Result<UdpEndpoint> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        if addr.is_ipv6() {
            let _ = socket.set_only_v6(false); // accept v4-mapped addresses on a v6 socket
        }
        let _ = socket.set_recv_buffer_size(kernel_receive_buffer_bytes as usize);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpEndpoint {
            socket: socket.into(),
            batch: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A cloned handle to the same underlying socket for worker threads to send from, so only
    /// the owning thread needs `&mut self` for `recv_batch`. `UdpSocket::send_to` takes `&self`,
    /// so every clone can send concurrently without additional locking.
    pub fn try_clone(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }

    /// Drain every datagram currently queued at the OS without blocking, up to `max_batch`.
    /// A `WouldBlock` simply ends the batch early; any other error is returned to the caller.
    pub fn recv_batch(&mut self, max_batch: usize) -> io::Result<usize> {
        self.batch.clear();
        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        while self.batch.len() < max_batch {
            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.batch.push((addr, buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.batch.len())
    }

    pub fn batch(&self) -> impl Iterator<Item = RecvDatagram<'_>> {
        self.batch.iter().map(|(addr, bytes)| RecvDatagram { addr: *addr, bytes })
    }

    /// Best-effort send: a `WouldBlock` (kernel send buffer full) is swallowed rather than
    /// propagated — reliable messages live in `sent_list` and retry on the next tick.
    pub fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(bytes, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Best-effort send on a raw cloned socket handle, for callers using [`UdpEndpoint::try_clone`]
/// directly instead of going through [`UdpEndpoint::send_to`].
pub fn send_to_best_effort(socket: &UdpSocket, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
    match socket.send_to(bytes, addr) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let mut a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let b_addr = b.local_addr().unwrap();
        b.send_to(b"hello", a.local_addr().unwrap()).unwrap();

        // Give the loopback delivery a moment; recv_batch is non-blocking.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let n = a.recv_batch(8).unwrap();
        assert_eq!(n, 1);
        let got: Vec<_> = a.batch().map(|d| (d.addr, d.bytes.to_vec())).collect();
        assert_eq!(got[0].0, b_addr);
        assert_eq!(got[0].1, b"hello");
    }

    #[test]
    fn recv_batch_respects_max() {
        let mut a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let a_addr = a.local_addr().unwrap();
        for _ in 0..5 {
            b.send_to(b"x", a_addr).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        let n = a.recv_batch(2).unwrap();
        assert_eq!(n, 2);
    }
}
