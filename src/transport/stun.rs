//! NAT traversal: public address discovery with STUN Binding requests (RFC 5389).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use super::socket::LocalSocket;

/// STUN magic cookie (RFC 5389).
const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN header size (type + length + magic + transaction ID).
const STUN_HEADER_SIZE: usize = 20;

/// Public STUN server used when none is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Where and how to ask for our public address.
#[derive(Debug, Clone)]
pub struct NatContext {
    pub stun_server: String,
    /// Wait per attempt.
    pub timeout: Duration,
    pub attempts: u32,
}

impl NatContext {
    pub fn new(stun_server: impl Into<String>) -> Self {
        Self {
            stun_server: stun_server.into(),
            timeout: Duration::from_secs(2),
            attempts: 2,
        }
    }

    /// Ask the STUN server how `socket` appears from outside.
    ///
    /// Uses a duplicate of the descriptor, so the socket must not be read by
    /// a running transport at the same time.
    pub async fn query_public_address(&self, socket: &LocalSocket) -> Result<SocketAddr> {
        let want_v6 = socket.local_addr().is_ipv6();
        let server_addr = tokio::net::lookup_host(&self.stun_server)
            .await
            .with_context(|| format!("Failed to resolve STUN server {}", self.stun_server))?
            .find(|a| a.is_ipv6() == want_v6)
            .with_context(|| format!("STUN server {} has no usable address", self.stun_server))?;

        let udp = socket.to_tokio()?;
        let txn_id = generate_transaction_id()?;
        let request = build_binding_request(&txn_id);

        for attempt in 0..self.attempts {
            udp.send_to(&request, server_addr)
                .await
                .with_context(|| format!("STUN send to {} failed", server_addr))?;

            let mut buf = [0u8; 512];
            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                match tokio::time::timeout_at(deadline, udp.recv_from(&mut buf)).await {
                    Ok(Ok((len, _from))) => {
                        let data = &buf[..len];
                        if get_transaction_id(data) != Some(txn_id) {
                            // Stray media or an old response; keep waiting
                            continue;
                        }
                        return parse_binding_response(data)
                            .context("STUN response carries no mapped address");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("STUN recv error (attempt {}): {}", attempt, e);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("STUN timeout (attempt {})", attempt);
                        break;
                    }
                }
            }
        }

        bail!("no STUN response from {}", server_addr)
    }
}

/// Random 12-byte STUN transaction ID.
fn generate_transaction_id() -> Result<[u8; 12]> {
    let mut txn = [0u8; 12];
    getrandom::getrandom(&mut txn).map_err(|e| anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(txn)
}

/// Minimal STUN Binding Request (header only, no attributes).
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STUN_HEADER_SIZE);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

/// Whether a datagram is a STUN message of any type.
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE {
        return false;
    }
    // First two bits must be 0, magic cookie must match.
    if data[0] & 0xC0 != 0 {
        return false;
    }
    u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

fn get_transaction_id(data: &[u8]) -> Option<[u8; 12]> {
    if !is_stun_message(data) {
        return None;
    }
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&data[8..20]);
    Some(txn)
}

/// Extract XOR-MAPPED-ADDRESS (or MAPPED-ADDRESS) from a Binding success response.
fn parse_binding_response(data: &[u8]) -> Option<SocketAddr> {
    if !is_stun_message(data) || u16::from_be_bytes([data[0], data[1]]) != BINDING_RESPONSE {
        return None;
    }

    let txn_id = &data[8..20];
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = std::cmp::min(STUN_HEADER_SIZE + msg_len, data.len());

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let attr_start = pos + 4;
        let attr_end = attr_start + attr_len;
        if attr_end > attrs_end {
            break;
        }

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return decode_xor_mapped_address(&data[attr_start..attr_end], txn_id)
            }
            ATTR_MAPPED_ADDRESS => return decode_mapped_address(&data[attr_start..attr_end]),
            _ => {}
        }

        // Attributes are padded to a 4-byte boundary
        pos = attr_start + ((attr_len + 3) & !3);
    }

    None
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();

    match value[1] {
        0x01 if value.len() >= 8 => {
            let ip = Ipv4Addr::new(
                value[4] ^ cookie[0],
                value[5] ^ cookie[1],
                value[6] ^ cookie[2],
                value[7] ^ cookie[3],
            );
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 && transaction_id.len() >= 12 => {
            let mut xor_key = [0u8; 16];
            xor_key[..4].copy_from_slice(&cookie);
            xor_key[4..].copy_from_slice(&transaction_id[..12]);
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ xor_key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Binding success response carrying an IPv4 XOR-MAPPED-ADDRESS.
#[cfg(test)]
pub(crate) fn build_binding_response(transaction_id: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
    let mut value = vec![0u8, 0x01];
    value.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    if let IpAddr::V4(ip) = mapped.ip() {
        for (o, c) in ip.octets().iter().zip(MAGIC_COOKIE.to_be_bytes()) {
            value.push(o ^ c);
        }
    }

    let mut buf = Vec::with_capacity(STUN_HEADER_SIZE + 4 + value.len());
    buf.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    buf.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(&value);
    buf
}

/// Fake STUN server on loopback that reflects the sender address
/// shifted by `port_offset`, so tests can tell a refreshed value apart.
#[cfg(test)]
pub(crate) async fn spawn_fake_stun_server(
    port_offset: u16,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, from)) = server.recv_from(&mut buf).await else {
                return;
            };
            let Some(txn) = get_transaction_id(&buf[..len]) else {
                continue;
            };
            let mapped = SocketAddr::new(from.ip(), from.port().wrapping_add(port_offset));
            let _ = server.send_to(&build_binding_response(&txn, mapped), from).await;
        }
    });
    (addr, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SocketKind;

    #[test]
    fn test_binding_request_layout() {
        let txn = [7u8; 12];
        let req = build_binding_request(&txn);
        assert_eq!(req.len(), STUN_HEADER_SIZE);
        assert!(is_stun_message(&req));
        assert_eq!(get_transaction_id(&req), Some(txn));
    }

    #[test]
    fn test_parse_xor_mapped_response() {
        let txn = [3u8; 12];
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let resp = build_binding_response(&txn, mapped);
        assert_eq!(parse_binding_response(&resp), Some(mapped));
    }

    #[test]
    fn test_rtp_is_not_stun() {
        let rtp = crate::rtp::RtpPacket::new(1, 2, 3, 0, false)
            .with_payload(&[0; 20])
            .serialize(0);
        assert!(!is_stun_message(&rtp));
    }

    #[tokio::test]
    async fn test_query_public_address_against_fake_server() {
        let (server, handle) = spawn_fake_stun_server(0).await;
        let sock =
            LocalSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, SocketKind::UdpIpv4).unwrap();

        let nat = NatContext::new(server.to_string());
        let public = nat.query_public_address(&sock).await.unwrap();
        assert_eq!(public, sock.local_addr());
        handle.abort();
    }

    #[tokio::test]
    async fn test_query_times_out_without_server() {
        // Bind then drop to get a loopback port nobody listens on
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        drop(silent);

        let sock =
            LocalSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, SocketKind::UdpIpv4).unwrap();
        let mut nat = NatContext::new(addr.to_string());
        nat.timeout = Duration::from_millis(50);
        nat.attempts = 1;
        assert!(nat.query_public_address(&sock).await.is_err());
    }
}
