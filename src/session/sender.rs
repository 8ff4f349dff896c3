//! Outbound media: framing, optional SRTP protection, one `sendto` per packet.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ManagerError, Result};
use crate::rtp::{RtpPacket, MAX_PAYLOAD_TYPE};
use crate::srtp::SRTP_MAX_TRAILER_LEN;
use crate::transport::UdpTransport;

use super::{lock, read, LifecycleState, Session, SessionStats};

impl Session {
    /// Frame `payload` with the session counters and send it to the remote
    /// RTP address.
    ///
    /// The marker bit flags the first packet of a talkspurt. When
    /// `last_packet_of_frame` is set, the timestamp advances by `duration`
    /// after this packet is built, so every packet of a frame shares one
    /// timestamp. Returns the number of bytes put on the wire.
    ///
    /// Concurrent callers are serialized until their packet is on the wire,
    /// so packets are protected and sent in sequence order.
    pub fn send(
        &self,
        payload: &[u8],
        duration: u32,
        marker: bool,
        last_packet_of_frame: bool,
    ) -> Result<usize> {
        if payload.is_empty() {
            return Err(ManagerError::InvalidArgument("payload"));
        }
        let (transport, dest) = self.send_target()?;

        // Held through protect: the SRTP rollover counter follows this order
        let mut counters = lock(&self.counters);
        let packet = RtpPacket::new(
            self.ssrc,
            counters.sequence_number,
            counters.timestamp,
            self.payload_type(),
            marker,
        )
        .with_payload(payload);
        counters.sequence_number = counters.sequence_number.wrapping_add(1);
        if last_packet_of_frame {
            counters.timestamp = counters.timestamp.wrapping_add(duration);
        }

        self.transmit(&transport, dest, &packet)
    }

    /// Send a caller-built packet as is. Session counters are not touched.
    pub fn send_packet(&self, packet: &RtpPacket) -> Result<usize> {
        if packet.payload_type > MAX_PAYLOAD_TYPE {
            return Err(ManagerError::InvalidArgument("payload type"));
        }
        let (transport, dest) = self.send_target()?;
        self.transmit(&transport, dest, packet)
    }

    /// Transport and resolved destination, or `NotStarted`. Not logged: a
    /// send racing teardown is expected.
    fn send_target(&self) -> Result<(Arc<UdpTransport>, SocketAddr)> {
        if self.state() != LifecycleState::Started {
            return Err(ManagerError::NotStarted);
        }
        let transport = self.transport().ok_or(ManagerError::NotStarted)?;
        let dest = read(&self.rtp).resolved_remote.ok_or(ManagerError::NotStarted)?;
        Ok((transport, dest))
    }

    fn transmit(
        &self,
        transport: &UdpTransport,
        dest: SocketAddr,
        packet: &RtpPacket,
    ) -> Result<usize> {
        let local = read(&self.negotiated_local).clone();

        let reserve = if local.is_some() { SRTP_MAX_TRAILER_LEN } else { 0 };
        let mut bytes = packet.serialize(reserve);

        if let Some(ctx) = &local {
            ctx.protect(&mut bytes).map_err(|e| {
                tracing::error!("srtp protect failed: {:#}", e);
                ManagerError::Protect(format!("{:#}", e))
            })?;
        }

        let sent = transport
            .send_to(transport.master().id(), dest, &bytes)
            .map_err(ManagerError::Send)?;
        if sent != bytes.len() {
            return Err(ManagerError::ShortWrite {
                sent,
                expected: bytes.len(),
            });
        }

        SessionStats::bump(&self.shared.stats.packets_sent, 1);
        SessionStats::bump(&self.shared.stats.bytes_sent, sent as u64);
        tracing::trace!(
            "RTP sent seq={} ts={} {} bytes to {}",
            packet.sequence_number,
            packet.timestamp,
            sent,
            dest
        );
        Ok(sent)
    }
}
