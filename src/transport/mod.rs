//! Packet-oriented UDP transport.
//!
//! A transport owns one master socket plus any number of auxiliary sockets,
//! runs one receive task per socket on the tokio runtime, and hands every
//! socket event to a single [`EventHandler`].

pub mod socket;
pub mod stun;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::DispatchError;
use socket::LocalSocket;
use stun::NatContext;

/// Receive scratch size; larger than any RTP packet on a standard MTU.
const RECV_BUFFER_SIZE: usize = 4096;

/// Process-unique identifier of a bound socket, used to demultiplex events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    UdpIpv4,
    UdpIpv6,
}

impl SocketKind {
    pub fn from_ipv6(ipv6: bool) -> Self {
        if ipv6 {
            SocketKind::UdpIpv6
        } else {
            SocketKind::UdpIpv4
        }
    }

    pub fn is_ipv6(self) -> bool {
        self == SocketKind::UdpIpv6
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::UdpIpv4 => f.write_str("UDP/IPv4"),
            SocketKind::UdpIpv6 => f.write_str("UDP/IPv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Data,
    Connected,
    Closed,
}

/// One event on one of the transport's sockets.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub kind: EventKind,
    pub local_socket: SocketId,
    /// Sender of a `Data` event.
    pub from: Option<SocketAddr>,
    pub data: Vec<u8>,
}

impl TransportEvent {
    pub fn data(local_socket: SocketId, from: SocketAddr, data: Vec<u8>) -> Self {
        Self {
            kind: EventKind::Data,
            local_socket,
            from: Some(from),
            data,
        }
    }

    fn control(kind: EventKind, local_socket: SocketId) -> Self {
        Self {
            kind,
            local_socket,
            from: None,
            data: Vec::new(),
        }
    }
}

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// RTP packet handed to the consumer.
    Rtp,
    /// RTCP datagram accepted.
    Rtcp,
    /// STUN message seen on a media socket and discarded.
    Stun,
    /// Event without payload.
    Ignored,
}

/// Receives every event of a transport, on the transport's receive task.
///
/// Errors are for observability only; the receive loop keeps running.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: TransportEvent) -> Result<Delivery, DispatchError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// UDP transport bound to a master socket, with optional auxiliary sockets.
pub struct UdpTransport {
    label: String,
    master: Arc<LocalSocket>,
    aux: Mutex<Vec<Arc<LocalSocket>>>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("label", &self.label)
            .field("master", &self.master.local_addr())
            .field("running", &self.is_running())
            .finish()
    }
}

impl UdpTransport {
    /// Bind the master socket at `ip:port`.
    pub fn create(ip: IpAddr, port: u16, kind: SocketKind, label: &str) -> io::Result<Self> {
        let master = LocalSocket::bind(ip, port, kind)?;
        tracing::debug!("[{}] transport bound at {}", label, master.local_addr());
        Ok(Self {
            label: label.to_string(),
            master: Arc::new(master),
            aux: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn master(&self) -> &Arc<LocalSocket> {
        &self.master
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Install the handler used by receive tasks spawned from now on.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    /// Spawn the master receive task, plus one per auxiliary socket already
    /// registered. No-op when running. Must be called within a tokio runtime.
    pub fn start(&self) -> io::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sockets = vec![self.master.clone()];
        sockets.extend(lock(&self.aux).iter().cloned());
        for sock in sockets {
            if let Err(e) = self.spawn_recv(sock) {
                self.abort_tasks();
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        }

        tracing::info!("[{}] transport started on {}", self.label, self.master.local_addr());
        Ok(())
    }

    /// Register an auxiliary socket; its events reach the same handler.
    /// Spawns its receive task at once if the transport is running.
    pub fn add_socket(&self, sock: Arc<LocalSocket>) -> io::Result<()> {
        {
            let mut aux = lock(&self.aux);
            if aux.iter().any(|s| s.id() == sock.id()) {
                return Ok(());
            }
            aux.push(sock.clone());
        }
        tracing::debug!(
            "[{}] added {} socket {} at {}",
            self.label,
            sock.kind(),
            sock.id(),
            sock.local_addr()
        );
        if self.is_running() {
            self.spawn_recv(sock)?;
        }
        Ok(())
    }

    /// Stop all receive tasks and forget auxiliary sockets.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<_> = lock(&self.tasks).drain(..).collect();
        for h in handles {
            h.abort();
            let _ = h.await;
        }
        lock(&self.aux).clear();

        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            let _ = handler.on_event(TransportEvent::control(EventKind::Closed, self.master.id()));
        }
        tracing::info!("[{}] transport shut down", self.label);
    }

    /// One non-blocking send from the socket identified by `from`.
    pub fn send_to(&self, from: SocketId, dest: SocketAddr, data: &[u8]) -> io::Result<usize> {
        if from == self.master.id() {
            return self.master.send_to(data, dest);
        }
        let sock = lock(&self.aux)
            .iter()
            .find(|s| s.id() == from)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("unknown socket {}", from))
            })?;
        sock.send_to(data, dest)
    }

    /// Resolve `host:port` to an address of the requested family.
    pub async fn resolve_address(
        host: &str,
        port: u16,
        kind: SocketKind,
    ) -> io::Result<SocketAddr> {
        if host.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host"));
        }
        tokio::net::lookup_host((host, port))
            .await?
            .find(|a| a.is_ipv6() == kind.is_ipv6())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} has no {} address", host, kind),
                )
            })
    }

    /// Discover how `sock` is seen from outside. Not available while running,
    /// since the receive task would consume the STUN response.
    pub async fn query_public_address(
        &self,
        sock: &LocalSocket,
        nat: &NatContext,
    ) -> anyhow::Result<SocketAddr> {
        if self.is_running() {
            anyhow::bail!("[{}] cannot query public address while running", self.label);
        }
        nat.query_public_address(sock).await
    }

    fn spawn_recv(&self, sock: Arc<LocalSocket>) -> io::Result<()> {
        let udp = sock.to_tokio()?;
        let handler = lock(&self.handler).clone();
        let label = self.label.clone();
        let handle = tokio::spawn(recv_loop(label, sock.id(), udp, handler));
        lock(&self.tasks).push(handle);
        Ok(())
    }

    fn abort_tasks(&self) {
        for h in lock(&self.tasks).drain(..) {
            h.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Receive loop: read datagrams and pass each to the handler.
async fn recv_loop(
    label: String,
    id: SocketId,
    socket: tokio::net::UdpSocket,
    handler: Option<Arc<dyn EventHandler>>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    tracing::debug!("[{}] recv loop started on {}", label, id);
    if let Some(h) = &handler {
        let _ = h.on_event(TransportEvent::control(EventKind::Connected, id));
    }

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let Some(h) = &handler else {
                    tracing::trace!("[{}] no handler, dropping {} bytes from {}", label, len, from);
                    continue;
                };
                if let Err(e) = h.on_event(TransportEvent::data(id, from, buf[..len].to_vec())) {
                    tracing::debug!("[{}] datagram from {} dropped: {}", label, from, e);
                }
            }
            Err(e) => {
                tracing::warn!("[{}] recv error on {}: {}", label, id, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Forward(mpsc::UnboundedSender<TransportEvent>);

    impl EventHandler for Forward {
        fn on_event(&self, event: TransportEvent) -> Result<Delivery, DispatchError> {
            let _ = self.0.send(event);
            Ok(Delivery::Ignored)
        }
    }

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if ev.kind == EventKind::Data {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn test_events_from_master_and_aux() {
        let transport = UdpTransport::create(LOOPBACK, 0, SocketKind::UdpIpv4, "test").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_handler(Arc::new(Forward(tx)));
        assert_ok!(transport.start());

        let aux = Arc::new(LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap());
        assert_ok!(transport.add_socket(aux.clone()));

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"to-master", transport.master().local_addr()).await.unwrap();
        let ev = next_data(&mut rx).await;
        assert_eq!(ev.local_socket, transport.master().id());
        assert_eq!(ev.data, b"to-master");
        assert_eq!(ev.from, Some(peer.local_addr().unwrap()));

        peer.send_to(b"to-aux", aux.local_addr()).await.unwrap();
        let ev = next_data(&mut rx).await;
        assert_eq!(ev.local_socket, aux.id());

        transport.shutdown().await;
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_send_to_unknown_socket_fails() {
        let transport = UdpTransport::create(LOOPBACK, 0, SocketKind::UdpIpv4, "test").unwrap();
        let other = LocalSocket::bind(LOOPBACK, 0, SocketKind::UdpIpv4).unwrap();
        let dest = other.local_addr();
        assert_err!(transport.send_to(other.id(), dest, b"x"));
        assert_eq!(assert_ok!(transport.send_to(transport.master().id(), dest, b"x")), 1);
    }

    #[tokio::test]
    async fn test_resolve_address_filters_family() {
        let addr = UdpTransport::resolve_address("127.0.0.1", 5004, SocketKind::UdpIpv4).await;
        assert_eq!(assert_ok!(addr), "127.0.0.1:5004".parse().unwrap());
        assert_err!(UdpTransport::resolve_address("127.0.0.1", 5004, SocketKind::UdpIpv6).await);
        assert_err!(UdpTransport::resolve_address("", 5004, SocketKind::UdpIpv4).await);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let transport = UdpTransport::create(LOOPBACK, 0, SocketKind::UdpIpv4, "test").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_handler(Arc::new(Forward(tx)));
        transport.start().unwrap();
        transport.shutdown().await;
        transport.start().unwrap();

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"again", transport.master().local_addr()).unwrap();
        assert_eq!(next_data(&mut rx).await.data, b"again");
    }
}
