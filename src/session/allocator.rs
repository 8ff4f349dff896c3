//! RTP/RTCP port pair allocation.

use std::net::IpAddr;

use rand::Rng;

use crate::error::{ManagerError, Result};
use crate::transport::socket::LocalSocket;
use crate::transport::{SocketKind, UdpTransport};

/// Attempts before giving up on finding a free RTCP port.
pub const BIND_ATTEMPTS: u8 = 7;

/// A bound RTP transport and, when RTCP is enabled, the socket above it.
#[derive(Debug)]
pub struct PortPair {
    pub transport: UdpTransport,
    pub rtcp: Option<LocalSocket>,
}

/// Draw an even port in `[start, stop)`. Port 0 is never drawn.
pub fn draw_even_port<R: Rng>(rng: &mut R, start: u16, stop: u16) -> Result<u16> {
    let first = (u32::from(start.max(2)) + 1) & !1;
    let stop = u32::from(stop);
    if first >= stop {
        return Err(ManagerError::InvalidArgument("port range has no even port"));
    }
    let count = (stop - first + 1) / 2;
    let port = first + 2 * rng.gen_range(0..count);
    // first and stop both fit u16 and port < stop
    Ok(port as u16)
}

/// Bind an RTP transport at a random even port and, if `rtcp_enabled`, an
/// RTCP socket at the next port.
///
/// A failed RTP bind is fatal. A failed RTCP bind releases the RTP side and
/// draws again, up to [`BIND_ATTEMPTS`] times.
pub fn allocate(
    ip: IpAddr,
    kind: SocketKind,
    start: u16,
    stop: u16,
    rtcp_enabled: bool,
    label: &str,
) -> Result<PortPair> {
    let mut rng = rand::thread_rng();

    // Failures below are expected while searching; say so before the warnings
    tracing::info!("RTP/RTCP manager[Begin]: Trying to bind to random ports");

    for attempt in 1..=BIND_ATTEMPTS {
        let port = draw_even_port(&mut rng, start, stop)?;

        let transport = UdpTransport::create(ip, port, kind, label).map_err(|e| {
            tracing::error!("Failed to create RTP/RTCP transport at {}:{}: {}", ip, port, e);
            ManagerError::TransportCreate(e)
        })?;

        if !rtcp_enabled {
            tracing::info!("RTP/RTCP manager[End]: RTP bound to {}:{}", ip, port);
            return Ok(PortPair {
                transport,
                rtcp: None,
            });
        }

        match LocalSocket::bind(ip, port + 1, kind) {
            Ok(rtcp) => {
                tracing::info!(
                    "RTP/RTCP manager[End]: RTP bound to {}:{}, RTCP to {}",
                    ip,
                    port,
                    port + 1
                );
                return Ok(PortPair {
                    transport,
                    rtcp: Some(rtcp),
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Attempt {}/{}: RTCP port {} unavailable ({}), retrying",
                    attempt,
                    BIND_ATTEMPTS,
                    port + 1,
                    e
                );
                drop(transport);
            }
        }
    }

    tracing::error!("RTP/RTCP manager[End]: no free port pair in [{}, {})", start, stop);
    Err(ManagerError::BindingExhausted {
        start,
        stop,
        attempts: BIND_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::{Ipv4Addr, UdpSocket};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_draw_stays_even_and_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let port = draw_even_port(&mut rng, 10001, 10010).unwrap();
            assert_eq!(port % 2, 0);
            assert!((10002..10010).contains(&port));
        }
    }

    #[test]
    fn test_draw_covers_top_of_port_space() {
        let mut rng = StdRng::seed_from_u64(1);
        let port = draw_even_port(&mut rng, 65534, 65535).unwrap();
        assert_eq!(port, 65534);
    }

    #[test]
    fn test_draw_rejects_range_without_even_port() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            draw_even_port(&mut rng, 10001, 10002),
            Err(ManagerError::InvalidArgument(_))
        ));
        assert!(matches!(
            draw_even_port(&mut rng, 0, 1),
            Err(ManagerError::InvalidArgument(_))
        ));
    }

    /// Even port `p` free on loopback with `p + 1` held by the returned socket.
    fn even_port_with_blocked_neighbour() -> (u16, UdpSocket) {
        for p in (41000u16..59000).step_by(2) {
            let Ok(blocker) = UdpSocket::bind((Ipv4Addr::LOCALHOST, p + 1)) else {
                continue;
            };
            if UdpSocket::bind((Ipv4Addr::LOCALHOST, p)).is_ok() {
                return (p, blocker);
            }
        }
        panic!("no usable port pair on loopback");
    }

    #[test]
    fn test_exhausted_when_rtcp_port_always_taken() {
        let (port, _blocker) = even_port_with_blocked_neighbour();
        let err =
            allocate(LOOPBACK, SocketKind::UdpIpv4, port, port + 1, true, "test").unwrap_err();
        match err {
            ManagerError::BindingExhausted { start, stop, attempts } => {
                assert_eq!((start, stop, attempts), (port, port + 1, BIND_ATTEMPTS));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The RTP side was released after every failed attempt
        assert!(UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }

    #[test]
    fn test_rtp_bind_failure_is_fatal() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port() & !1;
        // Make sure the even port itself is the one held
        let _even = UdpSocket::bind((Ipv4Addr::LOCALHOST, taken));
        let err =
            allocate(LOOPBACK, SocketKind::UdpIpv4, taken, taken + 1, true, "test").unwrap_err();
        assert!(matches!(err, ManagerError::TransportCreate(_)));
    }

    #[test]
    fn test_rtcp_disabled_binds_single_port() {
        let pair = allocate(LOOPBACK, SocketKind::UdpIpv4, 42000, 58000, false, "test").unwrap();
        assert!(pair.rtcp.is_none());
        assert_eq!(pair.transport.master().local_addr().port() % 2, 0);
    }
}
