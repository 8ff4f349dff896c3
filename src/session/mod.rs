//! RTP/RTCP session manager.
//!
//! A [`Session`] binds an even RTP port and the RTCP port above it, keeps the
//! outbound stream counters, negotiates SRTP from SDES crypto lines, and
//! routes inbound datagrams to a registered [`RtpConsumer`].
//!
//! ```text
//!   Idle --prepare--> Prepared --start--> Started --stop--> Stopped
//!                                            ^                  |
//!                                            +------start-------+
//! ```

pub mod allocator;
pub mod dispatcher;
pub mod sender;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::SessionConfig;
use crate::error::{ManagerError, Result};
use crate::rtp::{RtpPacket, MAX_PAYLOAD_TYPE};
use crate::srtp::negotiator::CryptoNegotiator;
use crate::srtp::{CryptoContext, CryptoSuite, SrtpEngine};
use crate::transport::socket::LocalSocket;
use crate::transport::stun::NatContext;
use crate::transport::{SocketKind, UdpTransport};

use dispatcher::Dispatcher;

/// Receive buffer while prepared but not started (the kernel doubles it).
pub const TINY_RCVBUF: usize = 128;
/// Production receive buffer.
pub const BIG_RCVBUF: usize = 64 * 1024;
/// Production send buffer.
pub const BIG_SNDBUF: usize = 64 * 1024;

/// Label given to the session's transport in logs.
const TRANSPORT_LABEL: &str = "RTP/RTCP Manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Prepared,
    Started,
    Stopped,
}

/// Sizing of the RTP socket buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveBuffers {
    /// Shrunk after binding so nothing piles up before start.
    Throttled,
    /// Production sizes.
    Normal,
}

/// Receives every deframed inbound RTP packet.
///
/// Called synchronously on the transport's receive task; the packet is only
/// borrowed for the duration of the call.
pub trait RtpConsumer: Send + Sync {
    fn on_rtp(&self, packet: &RtpPacket);
}

impl<F> RtpConsumer for F
where
    F: Fn(&RtpPacket) + Send + Sync,
{
    fn on_rtp(&self, packet: &RtpPacket) {
        self(packet)
    }
}

/// Counters updated from the send and receive paths.
#[derive(Debug, Default)]
pub struct SessionStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    rtcp_received: AtomicU64,
    decrypt_errors: AtomicU64,
    deframe_errors: AtomicU64,
    unknown_discards: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub rtcp_received: u64,
    pub decrypt_errors: u64,
    pub deframe_errors: u64,
    pub unknown_discards: u64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_sent: get(&self.packets_sent),
            bytes_sent: get(&self.bytes_sent),
            packets_received: get(&self.packets_received),
            bytes_received: get(&self.bytes_received),
            rtcp_received: get(&self.rtcp_received),
            decrypt_errors: get(&self.decrypt_errors),
            deframe_errors: get(&self.deframe_errors),
            unknown_discards: get(&self.unknown_discards),
        }
    }
}

/// State read by the dispatcher on the receive task.
#[derive(Default)]
pub(crate) struct Shared {
    consumer: RwLock<Option<Arc<dyn RtpConsumer>>>,
    negotiated_remote: RwLock<Option<Arc<CryptoContext>>>,
    stats: SessionStats,
}

#[derive(Debug, Clone, Copy)]
struct RtpCounters {
    sequence_number: u16,
    timestamp: u32,
}

#[derive(Debug, Default)]
struct RtpEndpoint {
    public_addr: Option<SocketAddr>,
    remote_host: Option<String>,
    remote_port: u16,
    resolved_remote: Option<SocketAddr>,
}

#[derive(Debug, Default)]
struct RtcpEndpoint {
    socket: Option<Arc<LocalSocket>>,
    public_addr: Option<SocketAddr>,
    remote_host: Option<String>,
    remote_port: u16,
    resolved_remote: Option<SocketAddr>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

/// One RTP stream with its RTCP companion.
///
/// Administrative calls (`prepare`, `start`, `stop`, setters) are expected
/// from one control task; `send` and the receive path may run concurrently
/// with each other.
pub struct Session {
    /// Creation-time settings; only the port range and payload type are
    /// copied out and may change later.
    config: SessionConfig,
    kind: SocketKind,
    engine: Option<Arc<SrtpEngine>>,

    ssrc: u32,
    payload_type: AtomicU8,
    port_range: Mutex<(u16, u16)>,
    state: Mutex<LifecycleState>,
    buffers: Mutex<ReceiveBuffers>,
    counters: Mutex<RtpCounters>,

    rtp: RwLock<RtpEndpoint>,
    rtcp: RwLock<RtcpEndpoint>,
    transport: RwLock<Option<Arc<UdpTransport>>>,
    nat: Mutex<Option<NatContext>>,

    negotiator: Mutex<CryptoNegotiator>,
    negotiated_local: RwLock<Option<Arc<CryptoContext>>>,
    shared: Arc<Shared>,
}

impl Session {
    /// Create an idle session. SSRC, initial sequence number and initial
    /// timestamp are drawn here and kept for the session's lifetime.
    ///
    /// Without an `engine` the session never encrypts. A payload type above
    /// 127 or an empty port range is rejected like the matching setters do.
    pub fn new(config: &SessionConfig, engine: Option<Arc<SrtpEngine>>) -> Result<Self> {
        if config.payload_type > MAX_PAYLOAD_TYPE {
            return Err(ManagerError::InvalidArgument("payload type"));
        }
        if config.port_range_start >= config.port_range_stop {
            return Err(ManagerError::InvalidArgument("port range"));
        }

        let ssrc: u32 = rand::random();
        let counters = RtpCounters {
            sequence_number: rand::random(),
            timestamp: rand::random(),
        };
        tracing::debug!(
            "New RTP session (SSRC: {:#010x}, seq: {}, ts: {})",
            ssrc,
            counters.sequence_number,
            counters.timestamp
        );

        Ok(Self {
            config: config.clone(),
            kind: SocketKind::from_ipv6(config.ipv6),
            engine,
            ssrc,
            payload_type: AtomicU8::new(config.payload_type),
            port_range: Mutex::new((config.port_range_start, config.port_range_stop)),
            state: Mutex::new(LifecycleState::Idle),
            buffers: Mutex::new(ReceiveBuffers::Normal),
            counters: Mutex::new(counters),
            rtp: RwLock::new(RtpEndpoint::default()),
            rtcp: RwLock::new(RtcpEndpoint::default()),
            transport: RwLock::new(None),
            nat: Mutex::new(None),
            negotiator: Mutex::new(CryptoNegotiator::new()),
            negotiated_local: RwLock::new(None),
            shared: Arc::new(Shared::default()),
        })
    }

    // ---- configuration ----

    /// Port range for `prepare`, `stop` exclusive. Fixed once prepared.
    pub fn set_port_range(&self, start: u16, stop: u16) -> Result<()> {
        if start >= stop {
            return Err(ManagerError::InvalidArgument("port range"));
        }
        if self.state() != LifecycleState::Idle {
            return Err(ManagerError::AlreadyPrepared);
        }
        *lock(&self.port_range) = (start, stop);
        Ok(())
    }

    pub fn port_range(&self) -> (u16, u16) {
        *lock(&self.port_range)
    }

    pub fn set_payload_type(&self, payload_type: u8) -> Result<()> {
        if payload_type > MAX_PAYLOAD_TYPE {
            return Err(ManagerError::InvalidArgument("payload type"));
        }
        self.payload_type.store(payload_type, Ordering::Relaxed);
        Ok(())
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type.load(Ordering::Relaxed)
    }

    /// Remote RTP endpoint, resolved at the next `start`.
    pub fn set_rtp_remote(&self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() || port == 0 {
            return Err(ManagerError::InvalidArgument("remote RTP host:port"));
        }
        let mut rtp = write(&self.rtp);
        rtp.remote_host = Some(host.to_string());
        rtp.remote_port = port;
        Ok(())
    }

    /// Remote RTCP endpoint. Defaults to the RTP remote when unset.
    pub fn set_rtcp_remote(&self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() || port == 0 {
            return Err(ManagerError::InvalidArgument("remote RTCP host:port"));
        }
        let mut rtcp = write(&self.rtcp);
        rtcp.remote_host = Some(host.to_string());
        rtcp.remote_port = port;
        Ok(())
    }

    pub fn set_consumer(&self, consumer: Arc<dyn RtpConsumer>) {
        *write(&self.shared.consumer) = Some(consumer);
    }

    pub fn clear_consumer(&self) {
        *write(&self.shared.consumer) = None;
    }

    // ---- crypto lines ----

    /// SDES lines for the local candidates, empty before `prepare` or
    /// without an engine.
    pub fn local_crypto_lines(&self) -> Vec<String> {
        lock(&self.negotiator)
            .local()
            .map(|ctx| ctx.to_crypto_line())
            .collect()
    }

    /// Install a remote proposal parsed from an SDES line. Takes effect at
    /// the next `start`.
    pub fn set_remote_crypto(&self, slot: usize, line: &str) -> Result<()> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| ManagerError::Crypto("SRTP is not available".into()))?;
        let ctx = engine
            .parse_crypto_line(line)
            .map_err(|e| ManagerError::Crypto(format!("{:#}", e)))?;
        if !lock(&self.negotiator).set_remote(slot, ctx) {
            return Err(ManagerError::InvalidArgument("crypto slot"));
        }
        Ok(())
    }

    pub fn clear_remote_crypto(&self) {
        lock(&self.negotiator).clear_remote();
    }

    // ---- lifecycle ----

    /// Bind the RTP/RTCP pair, install the dispatcher and create the local
    /// crypto candidates.
    pub fn prepare(&self) -> Result<()> {
        if self.state() != LifecycleState::Idle {
            return Err(ManagerError::AlreadyPrepared);
        }

        let ip: IpAddr = self.config.bind_ip().map_err(|e| {
            tracing::error!("{:#}", e);
            ManagerError::InvalidArgument("local bind address")
        })?;

        if let Some(engine) = &self.engine {
            lock(&self.negotiator)
                .init_local(engine, self.ssrc)
                .map_err(|e| ManagerError::Crypto(format!("{:#}", e)))?;
        }

        let (start, stop) = self.port_range();
        let pair = allocator::allocate(
            ip,
            self.kind,
            start,
            stop,
            self.config.rtcp_enabled,
            TRANSPORT_LABEL,
        )?;
        let transport = Arc::new(pair.transport);
        let rtcp_socket = pair.rtcp.map(Arc::new);

        // Keep the kernel from queueing media until start
        match transport.master().set_recv_buffer_size(TINY_RCVBUF) {
            Ok(()) => *lock(&self.buffers) = ReceiveBuffers::Throttled,
            Err(e) => tracing::warn!("Failed to shrink RTP receive buffer: {}", e),
        }

        let dispatcher = Dispatcher::new(
            transport.master().id(),
            rtcp_socket.as_ref().map(|s| s.id()),
            self.shared.clone(),
        );
        transport.set_event_handler(Arc::new(dispatcher));

        write(&self.rtp).public_addr = Some(transport.master().local_addr());
        {
            let mut rtcp = write(&self.rtcp);
            rtcp.public_addr = rtcp_socket.as_ref().map(|s| s.local_addr());
            rtcp.socket = rtcp_socket;
        }
        *write(&self.transport) = Some(transport);
        self.set_state(LifecycleState::Prepared);
        Ok(())
    }

    /// Restore production buffer sizes if throttled. Idempotent.
    pub fn enable_receive_buffers(&self) -> Result<()> {
        let transport = self.transport().ok_or(ManagerError::NotPrepared)?;
        let mut buffers = lock(&self.buffers);
        if *buffers == ReceiveBuffers::Normal {
            return Ok(());
        }
        let master = transport.master();
        master.set_recv_buffer_size(BIG_RCVBUF)?;
        master.set_send_buffer_size(BIG_SNDBUF)?;
        *buffers = ReceiveBuffers::Normal;
        tracing::debug!("RTP socket buffers restored");
        Ok(())
    }

    /// Begin delivering media. No-op when already started.
    pub async fn start(&self) -> Result<()> {
        if self.state() == LifecycleState::Started {
            return Ok(());
        }
        let transport = self.transport().ok_or(ManagerError::NotPrepared)?;

        if let Err(e) = self.enable_receive_buffers() {
            tracing::warn!("Failed to restore RTP socket buffers: {}", e);
        }

        tracing::debug!("Start flushing RTP socket...");
        let flushed = transport.master().drain();
        tracing::debug!("End flushing RTP socket ({} datagrams)", flushed);

        if let Err(e) = transport.start() {
            tracing::error!("Failed to start the RTP/RTCP transport: {}", e);
            return Err(ManagerError::TransportStart(e));
        }

        let (rtp_host, rtp_port) = {
            let rtp = read(&self.rtp);
            (rtp.remote_host.clone().unwrap_or_default(), rtp.remote_port)
        };
        match UdpTransport::resolve_address(&rtp_host, rtp_port, self.kind).await {
            Ok(addr) => write(&self.rtp).resolved_remote = Some(addr),
            Err(e) => {
                tracing::error!("Invalid RTP host:port [{}:{}]: {}", rtp_host, rtp_port, e);
                transport.shutdown().await;
                return Err(ManagerError::Resolve {
                    host: rtp_host,
                    port: rtp_port,
                });
            }
        }

        if self.config.rtcp_enabled {
            self.start_rtcp(&transport, &rtp_host, rtp_port).await;
        }

        let encrypted = {
            let mut negotiator = lock(&self.negotiator);
            let encrypted = negotiator.negotiate();
            *write(&self.negotiated_local) = negotiator.negotiated_local();
            *write(&self.shared.negotiated_remote) = negotiator.negotiated_remote();
            encrypted
        };

        self.set_state(LifecycleState::Started);
        tracing::info!(
            "RTP session started ({} -> {}:{}, {})",
            transport.master().local_addr(),
            rtp_host,
            rtp_port,
            if encrypted { "SRTP" } else { "cleartext" }
        );
        Ok(())
    }

    /// RTCP is best effort: failures are logged and start carries on.
    async fn start_rtcp(&self, transport: &UdpTransport, rtp_host: &str, rtp_port: u16) {
        let (socket, host, port) = {
            let mut rtcp = write(&self.rtcp);
            if rtcp.remote_host.is_none() {
                rtcp.remote_host = Some(rtp_host.to_string());
            }
            if rtcp.remote_port == 0 {
                rtcp.remote_port = rtp_port;
            }
            (
                rtcp.socket.clone(),
                rtcp.remote_host.clone().unwrap_or_default(),
                rtcp.remote_port,
            )
        };

        match UdpTransport::resolve_address(&host, port, self.kind).await {
            Ok(addr) => write(&self.rtcp).resolved_remote = Some(addr),
            Err(e) => tracing::warn!("Invalid RTCP host:port [{}:{}]: {}", host, port, e),
        }

        if let Some(socket) = socket {
            if let Err(e) = transport.add_socket(socket) {
                tracing::warn!("Failed to add RTCP socket: {}", e);
            }
        }
    }

    /// Shut the transport down. No-op unless started.
    pub async fn stop(&self) -> Result<()> {
        if self.state() != LifecycleState::Started {
            tracing::debug!("RTP session not started");
            return Ok(());
        }
        if let Some(transport) = self.transport() {
            transport.shutdown().await;
        }
        self.set_state(LifecycleState::Stopped);

        let stats = self.stats();
        tracing::info!(
            "RTP session stopped. Sent: {}, Received: {} ({} bytes)",
            stats.packets_sent,
            stats.packets_received,
            stats.bytes_received
        );
        Ok(())
    }

    /// Attach a NAT traversal context and refresh the public RTP/RTCP
    /// addresses through it. Only while prepared and not started.
    pub async fn set_nat_context(&self, nat: NatContext) -> Result<()> {
        match self.state() {
            LifecycleState::Idle => return Err(ManagerError::NotPrepared),
            LifecycleState::Started => {
                return Err(ManagerError::Nat("cannot refresh public address while started".into()))
            }
            LifecycleState::Prepared | LifecycleState::Stopped => {}
        }
        let transport = self.transport().ok_or(ManagerError::NotPrepared)?;

        // STUN responses need room in the receive buffer
        self.enable_receive_buffers()?;

        match transport.query_public_address(transport.master(), &nat).await {
            Ok(addr) => {
                tracing::info!("RTP public address: {}", addr);
                write(&self.rtp).public_addr = Some(addr);
            }
            Err(e) => tracing::warn!("RTP public address query failed: {:#}", e),
        }

        let rtcp_socket = read(&self.rtcp).socket.clone();
        if let Some(socket) = rtcp_socket {
            match transport.query_public_address(&socket, &nat).await {
                Ok(addr) => {
                    tracing::info!("RTCP public address: {}", addr);
                    write(&self.rtcp).public_addr = Some(addr);
                }
                Err(e) => tracing::warn!("RTCP public address query failed: {:#}", e),
            }
        }

        *lock(&self.nat) = Some(nat);
        Ok(())
    }

    // ---- accessors ----

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LifecycleState) {
        *lock(&self.state) = state;
    }

    pub fn is_prepared(&self) -> bool {
        self.state() != LifecycleState::Idle
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    fn transport(&self) -> Option<Arc<UdpTransport>> {
        read(&self.transport).clone()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn sequence_number(&self) -> u16 {
        lock(&self.counters).sequence_number
    }

    /// Timestamp the next packet will carry.
    pub fn timestamp(&self) -> u32 {
        lock(&self.counters).timestamp
    }

    pub fn rtp_public_addr(&self) -> Option<SocketAddr> {
        read(&self.rtp).public_addr
    }

    pub fn rtcp_public_addr(&self) -> Option<SocketAddr> {
        read(&self.rtcp).public_addr
    }

    pub fn rtp_remote_addr(&self) -> Option<SocketAddr> {
        read(&self.rtp).resolved_remote
    }

    pub fn rtcp_remote_addr(&self) -> Option<SocketAddr> {
        read(&self.rtcp).resolved_remote
    }

    pub fn receive_buffers(&self) -> ReceiveBuffers {
        *lock(&self.buffers)
    }

    pub fn receive_throttled(&self) -> bool {
        self.receive_buffers() == ReceiveBuffers::Throttled
    }

    pub fn nat_context(&self) -> Option<NatContext> {
        lock(&self.nat).clone()
    }

    /// Local and remote suites in effect, or `None` for cleartext.
    pub fn negotiated_suites(&self) -> Option<(CryptoSuite, CryptoSuite)> {
        let local = read(&self.negotiated_local).clone()?;
        let remote = read(&self.shared.negotiated_remote).clone()?;
        Some((local.suite(), remote.suite()))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping the transport aborts its receive tasks
        if self.state() == LifecycleState::Started {
            tracing::debug!("Dropping started RTP session (SSRC: {:#010x})", self.ssrc);
        }
    }
}
