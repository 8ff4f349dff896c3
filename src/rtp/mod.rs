//! RTP packet framing and deframing (RFC 3550).
//!
//! RTP header format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use anyhow::{bail, Result};

/// Minimum RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP protocol version carried in every header.
pub const RTP_VERSION: u8 = 2;

/// Highest legal payload type (7 bits).
pub const MAX_PAYLOAD_TYPE: u8 = 0x7F;

/// Compute the full RTP header length from raw packet bytes.
///
/// Accounts for CSRC entries and header extensions (RFC 3550 §5.3.1).
/// Returns `None` if the packet is too short.
pub fn full_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < RTP_HEADER_SIZE {
        return None;
    }
    let csrc_count = (data[0] & 0x0F) as usize;
    let has_extension = (data[0] >> 4) & 0x01 != 0;
    let mut len = RTP_HEADER_SIZE + csrc_count * 4;
    if data.len() < len {
        return None;
    }
    if has_extension {
        // 2 bytes profile + 2 bytes length (in 32-bit words)
        if data.len() < len + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([data[len + 2], data[len + 3]]) as usize;
        len += 4 + ext_words * 4;
        if data.len() < len {
            return None;
        }
    }
    Some(len)
}

/// Header extension block: profile-defined id plus 32-bit aligned data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    pub data: Vec<u8>,
}

/// An RTP packet as seen by the session manager and its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<HeaderExtension>,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Create a packet header with an empty payload.
    pub fn new(
        ssrc: u32,
        sequence_number: u16,
        timestamp: u32,
        payload_type: u8,
        marker: bool,
    ) -> Self {
        Self {
            marker,
            payload_type: payload_type & MAX_PAYLOAD_TYPE,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
            payload: Vec::new(),
        }
    }

    /// Attach the payload bytes.
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Length of the header as it will be written by [`serialize`](Self::serialize).
    pub fn header_len(&self) -> usize {
        let ext_len = self
            .extension
            .as_ref()
            .map(|ext| 4 + padded_len(ext.data.len()))
            .unwrap_or(0);
        RTP_HEADER_SIZE + self.csrc.len().min(15) * 4 + ext_len
    }

    /// Frame the packet into bytes.
    ///
    /// `trailer_reserve` extra bytes of capacity are reserved past the end of
    /// the packet so an SRTP tag can be appended without reallocating.
    pub fn serialize(&self, trailer_reserve: usize) -> Vec<u8> {
        let csrc = &self.csrc[..self.csrc.len().min(15)];
        let mut buf =
            Vec::with_capacity(self.header_len() + self.payload.len() + trailer_reserve);

        // Byte 0: V=2, P=0, X, CC
        let mut b0 = RTP_VERSION << 6 | csrc.len() as u8;
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        buf.push(b0);
        // Byte 1: M, PT
        let mut b1 = self.payload_type & MAX_PAYLOAD_TYPE;
        if self.marker {
            b1 |= 0x80;
        }
        buf.push(b1);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for c in csrc {
            buf.extend_from_slice(&c.to_be_bytes());
        }
        if let Some(ext) = &self.extension {
            let padded = padded_len(ext.data.len());
            buf.extend_from_slice(&ext.profile.to_be_bytes());
            buf.extend_from_slice(&((padded / 4) as u16).to_be_bytes());
            buf.extend_from_slice(&ext.data);
            buf.resize(buf.len() + (padded - ext.data.len()), 0);
        }
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deframe bytes into a packet. Trailing RTP padding is stripped.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            bail!("RTP packet too short: {} bytes", data.len());
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            bail!("Unsupported RTP version: {}", version);
        }

        let has_padding = (data[0] >> 5) & 0x01 != 0;
        let has_extension = (data[0] >> 4) & 0x01 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = (data[1] >> 7) & 0x01 != 0;
        let payload_type = data[1] & MAX_PAYLOAD_TYPE;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let header_len = match full_header_len(data) {
            Some(len) => len,
            None => bail!(
                "RTP header truncated ({} CSRCs, extension: {}): {} bytes",
                csrc_count,
                has_extension,
                data.len()
            ),
        };

        let csrc = (0..csrc_count)
            .map(|i| {
                let at = RTP_HEADER_SIZE + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();

        let extension = if has_extension {
            let at = RTP_HEADER_SIZE + csrc_count * 4;
            Some(HeaderExtension {
                profile: u16::from_be_bytes([data[at], data[at + 1]]),
                data: data[at + 4..header_len].to_vec(),
            })
        } else {
            None
        };

        let mut payload_end = data.len();
        if has_padding {
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || header_len + pad > data.len() {
                bail!("Invalid RTP padding count: {}", pad);
            }
            payload_end -= pad;
        }

        Ok(RtpPacket {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: data[header_len..payload_end].to_vec(),
        })
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}
