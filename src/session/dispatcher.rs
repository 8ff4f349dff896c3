//! Inbound datagram routing: RTCP, RTP or unknown socket.

use std::sync::Arc;

use crate::error::DispatchError;
use crate::rtp::RtpPacket;
use crate::transport::stun::is_stun_message;
use crate::transport::{Delivery, EventHandler, EventKind, SocketId, TransportEvent};

use super::{read, SessionStats, Shared};

/// Event handler installed on a session's transport.
pub(crate) struct Dispatcher {
    rtp_socket: SocketId,
    rtcp_socket: Option<SocketId>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(
        rtp_socket: SocketId,
        rtcp_socket: Option<SocketId>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            rtp_socket,
            rtcp_socket,
            shared,
        }
    }

    fn on_rtcp(&self, mut data: Vec<u8>) -> Result<Delivery, DispatchError> {
        if is_stun_message(&data) {
            tracing::trace!("STUN message on RTCP socket, discarded");
            return Ok(Delivery::Stun);
        }

        let remote = read(&self.shared.negotiated_remote).clone();
        if let Some(ctx) = remote {
            if let Err(e) = ctx.unprotect_rtcp(&mut data) {
                SessionStats::bump(&self.shared.stats.decrypt_errors, 1);
                return Err(DispatchError::Unprotect(format!("{:#}", e)));
            }
        }

        SessionStats::bump(&self.shared.stats.rtcp_received, 1);
        tracing::trace!("RTCP packet ({} bytes)", data.len());
        Ok(Delivery::Rtcp)
    }

    fn on_rtp(&self, mut data: Vec<u8>) -> Result<Delivery, DispatchError> {
        if is_stun_message(&data) {
            tracing::trace!("STUN message on RTP socket, discarded");
            return Ok(Delivery::Stun);
        }

        let Some(consumer) = read(&self.shared.consumer).clone() else {
            return Err(DispatchError::NoConsumer);
        };

        let remote = read(&self.shared.negotiated_remote).clone();
        if let Some(ctx) = remote {
            if let Err(e) = ctx.unprotect(&mut data) {
                SessionStats::bump(&self.shared.stats.decrypt_errors, 1);
                return Err(DispatchError::Unprotect(format!("{:#}", e)));
            }
        }

        let packet = match RtpPacket::deserialize(&data) {
            Ok(p) => p,
            Err(e) => {
                SessionStats::bump(&self.shared.stats.deframe_errors, 1);
                return Err(DispatchError::Deframe(format!("{:#}", e)));
            }
        };

        SessionStats::bump(&self.shared.stats.packets_received, 1);
        SessionStats::bump(&self.shared.stats.bytes_received, data.len() as u64);
        consumer.on_rtp(&packet);
        Ok(Delivery::Rtp)
    }
}

impl EventHandler for Dispatcher {
    fn on_event(&self, event: TransportEvent) -> Result<Delivery, DispatchError> {
        if event.kind != EventKind::Data {
            return Ok(Delivery::Ignored);
        }

        if Some(event.local_socket) == self.rtcp_socket {
            self.on_rtcp(event.data)
        } else if event.local_socket == self.rtp_socket {
            self.on_rtp(event.data)
        } else {
            SessionStats::bump(&self.shared.stats.unknown_discards, 1);
            tracing::debug!("Datagram on unknown socket {}, discarded", event.local_socket);
            Err(DispatchError::UnknownSocket(event.local_socket))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{write, RtpConsumer};
    use crate::srtp::{CryptoSuite, SrtpEngine};
    use std::sync::Mutex;

    const RTP: SocketId = SocketId(100);
    const RTCP: SocketId = SocketId(101);

    #[derive(Default)]
    struct Collect(Mutex<Vec<RtpPacket>>);

    impl RtpConsumer for Collect {
        fn on_rtp(&self, packet: &RtpPacket) {
            self.0.lock().unwrap().push(packet.clone());
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<Shared>, Arc<Collect>) {
        let shared = Arc::new(Shared::default());
        let collect = Arc::new(Collect::default());
        *write(&shared.consumer) = Some(collect.clone());
        (Dispatcher::new(RTP, Some(RTCP), shared.clone()), shared, collect)
    }

    fn data(socket: SocketId, bytes: Vec<u8>) -> TransportEvent {
        TransportEvent::data(socket, "127.0.0.1:5004".parse().unwrap(), bytes)
    }

    fn rtp_bytes(seq: u16, payload: &[u8]) -> Vec<u8> {
        RtpPacket::new(0xCAFE, seq, 1000, 0, false)
            .with_payload(payload)
            .serialize(0)
    }

    #[test]
    fn test_valid_rtp_reaches_consumer() {
        let (d, shared, collect) = dispatcher();
        assert_eq!(d.on_event(data(RTP, rtp_bytes(1, b"abc"))).unwrap(), Delivery::Rtp);
        let got = collect.0.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"abc");
        assert_eq!(shared.stats.snapshot().packets_received, 1);
    }

    #[test]
    fn test_corrupted_rtp_dropped_and_next_delivered() {
        let (d, shared, collect) = dispatcher();
        let err = d.on_event(data(RTP, vec![0x80, 0x00, 0x01])).unwrap_err();
        assert!(matches!(err, DispatchError::Deframe(_)));
        assert!(collect.0.lock().unwrap().is_empty());

        assert_eq!(d.on_event(data(RTP, rtp_bytes(2, b"ok"))).unwrap(), Delivery::Rtp);
        assert_eq!(collect.0.lock().unwrap().len(), 1);
        let stats = shared.stats.snapshot();
        assert_eq!(stats.deframe_errors, 1);
        assert_eq!(stats.packets_received, 1);
    }

    #[test]
    fn test_control_events_ignored() {
        let (d, _, collect) = dispatcher();
        let mut ev = data(RTP, rtp_bytes(1, b"x"));
        ev.kind = EventKind::Connected;
        assert_eq!(d.on_event(ev.clone()).unwrap(), Delivery::Ignored);
        ev.kind = EventKind::Closed;
        assert_eq!(d.on_event(ev).unwrap(), Delivery::Ignored);
        assert!(collect.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_socket_discarded() {
        let (d, shared, _) = dispatcher();
        let err = d.on_event(data(SocketId(999), rtp_bytes(1, b"x"))).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownSocket(SocketId(999))));
        assert_eq!(shared.stats.snapshot().unknown_discards, 1);
    }

    #[test]
    fn test_rtp_without_consumer() {
        let (d, shared, _) = dispatcher();
        *write(&shared.consumer) = None;
        assert!(matches!(
            d.on_event(data(RTP, rtp_bytes(1, b"x"))),
            Err(DispatchError::NoConsumer)
        ));
    }

    #[test]
    fn test_rtcp_counted_not_delivered() {
        let (d, shared, collect) = dispatcher();
        let rtcp = vec![0x80, 200, 0x00, 0x01, 0, 0, 0, 1];
        assert_eq!(d.on_event(data(RTCP, rtcp)).unwrap(), Delivery::Rtcp);
        assert!(collect.0.lock().unwrap().is_empty());
        assert_eq!(shared.stats.snapshot().rtcp_received, 1);
    }

    #[test]
    fn test_stun_on_media_socket_discarded() {
        let (d, shared, collect) = dispatcher();
        let mut stun = vec![0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xA4, 0x42];
        stun.extend_from_slice(&[9u8; 12]);
        assert_eq!(d.on_event(data(RTP, stun)).unwrap(), Delivery::Stun);
        assert!(collect.0.lock().unwrap().is_empty());
        assert_eq!(shared.stats.snapshot().deframe_errors, 0);
    }

    #[test]
    fn test_srtp_decrypt_and_failure() {
        let engine = SrtpEngine::init().unwrap();
        let material = engine.generate_material().unwrap();
        let line = engine
            .create_context(1, CryptoSuite::AesCm128HmacSha1_80, material, Some(0xCAFE))
            .to_crypto_line();
        let sender = engine.parse_crypto_line(&line).unwrap();
        let receiver = engine.parse_crypto_line(&line).unwrap();

        let (d, shared, collect) = dispatcher();
        *write(&shared.negotiated_remote) = Some(Arc::new(receiver));

        let mut good = rtp_bytes(10, b"secret");
        sender.protect(&mut good).unwrap();
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        assert!(matches!(d.on_event(data(RTP, bad)), Err(DispatchError::Unprotect(_))));
        assert_eq!(d.on_event(data(RTP, good)).unwrap(), Delivery::Rtp);
        assert_eq!(collect.0.lock().unwrap()[0].payload, b"secret");
        assert_eq!(shared.stats.snapshot().decrypt_errors, 1);
    }

    #[test]
    fn test_srtcp_unprotected_with_remote_context() {
        let engine = SrtpEngine::init().unwrap();
        let material = engine.generate_material().unwrap();
        let line = engine
            .create_context(1, CryptoSuite::AesCm128HmacSha1_32, material, None)
            .to_crypto_line();
        let sender = engine.parse_crypto_line(&line).unwrap();
        let (d, shared, _) = dispatcher();
        let receiver = engine.parse_crypto_line(&line).unwrap();
        *write(&shared.negotiated_remote) = Some(Arc::new(receiver));

        let mut rtcp = vec![0x80, 200, 0x00, 0x06, 0, 0, 0, 7];
        rtcp.extend_from_slice(&[0x42; 20]);
        sender.protect_rtcp(&mut rtcp).unwrap();
        assert_eq!(d.on_event(data(RTCP, rtcp)).unwrap(), Delivery::Rtcp);

        // Plain RTCP fails authentication once SRTP is negotiated
        let plain = vec![
            0x80, 200, 0x00, 0x06, 0, 0, 0, 7, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14,
        ];
        assert!(matches!(d.on_event(data(RTCP, plain)), Err(DispatchError::Unprotect(_))));
        assert_eq!(shared.stats.snapshot().rtcp_received, 1);
    }
}
