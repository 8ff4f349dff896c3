//! Non-blocking UDP socket owned by a session and lent to the transport.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{SocketId, SocketKind};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Scratch size for draining stale datagrams.
const DRAIN_BUFFER_SIZE: usize = 2048;

/// A bound, non-blocking UDP socket with a process-unique id.
#[derive(Debug)]
pub struct LocalSocket {
    id: SocketId,
    kind: SocketKind,
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl LocalSocket {
    /// Bind a UDP socket at `ip:port`. Address reuse is left off so that a
    /// port already taken by another socket fails the bind.
    pub fn bind(ip: IpAddr, port: u16, kind: SocketKind) -> io::Result<Self> {
        let domain = match kind {
            SocketKind::UdpIpv4 => Domain::IPV4,
            SocketKind::UdpIpv6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if kind == SocketKind::UdpIpv6 {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(ip, port).into())?;

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;
        let id = SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed));
        tracing::trace!("Bound {} socket {} at {}", kind, id, local_addr);

        Ok(Self {
            id,
            kind,
            socket,
            local_addr,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_recv_buffer_size(size)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_send_buffer_size(size)
    }

    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        SockRef::from(&self.socket).recv_buffer_size()
    }

    /// Discard every datagram already queued in the kernel.
    ///
    /// Only non-blocking reads are issued; the loop ends at the first
    /// `WouldBlock`. Returns the number of datagrams discarded.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; DRAIN_BUFFER_SIZE];
        let mut flushed = 0;
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    tracing::debug!("Flushing {} stale bytes from {} on {}", len, from, self.id);
                    flushed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP errors surface as ConnectionReset on some platforms; skip them
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::debug!("Stopped flushing {}: {}", self.id, e);
                    break;
                }
            }
        }
        flushed
    }

    /// One non-blocking `sendto`.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest)
    }

    /// Register a duplicate of the descriptor with the tokio reactor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn to_tokio(&self) -> io::Result<tokio::net::UdpSocket> {
        tokio::net::UdpSocket::from_std(self.socket.try_clone()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_bind_assigns_unique_ids() {
        let a = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        let b = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.local_addr().port() > 0);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let a = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        let port = a.local_addr().port();
        assert!(LocalSocket::bind(LOOPBACK, port, SocketKind::UdpIpv4).is_err());
    }

    #[test]
    fn test_drain_empties_queue_without_blocking() {
        let sock = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..3u8 {
            sender.send_to(&[i; 20], sock.local_addr()).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(sock.drain(), 3);
        assert_eq!(sock.drain(), 0);
    }

    #[test]
    fn test_buffer_sizes_adjustable() {
        let sock = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        sock.set_recv_buffer_size(64 * 1024).unwrap();
        sock.set_send_buffer_size(64 * 1024).unwrap();
        assert!(sock.recv_buffer_size().unwrap() >= 64 * 1024 / 2);
    }
}
