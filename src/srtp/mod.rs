//! SRTP/SRTCP protection using AES-128-CM with HMAC-SHA1 (RFC 3711).
//!
//! A [`CryptoContext`] is one crypto line: a suite, its master key material
//! and the per-direction stream state (rollover counter, SRTCP index). Local
//! contexts protect what we send, remote contexts unprotect what we receive.
//! Contexts are only created through an initialized [`SrtpEngine`].

pub mod negotiator;

use std::fmt;
use std::sync::Mutex;

use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::rtp;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// SRTCP auth tag length (always 80 bits, whatever the SRTP suite).
pub const SRTCP_AUTH_TAG_LEN: usize = 10;

/// Size of the SRTCP E-flag + index word.
const SRTCP_INDEX_LEN: usize = 4;

/// Largest trailer any supported suite appends to a packet.
pub const SRTP_MAX_TRAILER_LEN: usize = SRTCP_INDEX_LEN + SRTCP_AUTH_TAG_LEN;

/// Master key length for AES-128 (16 bytes).
const MASTER_KEY_LEN: usize = 16;

/// Master salt length (14 bytes per RFC 3711).
const MASTER_SALT_LEN: usize = 14;

/// Total keying material: 16 bytes key + 14 bytes salt = 30 bytes.
const KEYING_MATERIAL_LEN: usize = MASTER_KEY_LEN + MASTER_SALT_LEN;

/// SRTP key derivation labels (RFC 3711, section 4.3.1).
const LABEL_CIPHER_KEY: u8 = 0x00;
const LABEL_AUTH_KEY: u8 = 0x01;
const LABEL_SALT: u8 = 0x02;

/// SRTCP key derivation labels (RFC 3711, section 3.4).
const LABEL_SRTCP_CIPHER_KEY: u8 = 0x03;
const LABEL_SRTCP_AUTH_KEY: u8 = 0x04;
const LABEL_SRTCP_SALT: u8 = 0x05;

/// Minimum RTCP header size: V/P/RC(1) + PT(1) + length(2) + SSRC(4) = 8 bytes.
const RTCP_HEADER_SIZE: usize = 8;

/// SDES crypto suite (RFC 4568).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoSuite {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
}

impl CryptoSuite {
    /// Name as it appears on an `a=crypto` line.
    pub fn name(self) -> &'static str {
        match self {
            CryptoSuite::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            CryptoSuite::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_80" => Some(CryptoSuite::AesCm128HmacSha1_80),
            "AES_CM_128_HMAC_SHA1_32" => Some(CryptoSuite::AesCm128HmacSha1_32),
            _ => None,
        }
    }

    /// Bytes of SRTP auth tag appended to each RTP packet.
    pub fn rtp_tag_len(self) -> usize {
        match self {
            CryptoSuite::AesCm128HmacSha1_80 => 10,
            CryptoSuite::AesCm128HmacSha1_32 => 4,
        }
    }
}

impl fmt::Display for CryptoSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Master key and salt for one crypto line.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyingMaterial {
    pub master_key: [u8; MASTER_KEY_LEN],
    pub master_salt: [u8; MASTER_SALT_LEN],
}

impl KeyingMaterial {
    /// Decode the base64 `key||salt` blob of an `inline:` key parameter.
    pub fn from_base64(b64: &str) -> Result<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .context("failed to base64 decode SRTP key")?;

        if decoded.len() < KEYING_MATERIAL_LEN {
            bail!(
                "SRTP keying material too short: {} bytes (need {})",
                decoded.len(),
                KEYING_MATERIAL_LEN
            );
        }

        let mut master_key = [0u8; MASTER_KEY_LEN];
        let mut master_salt = [0u8; MASTER_SALT_LEN];
        master_key.copy_from_slice(&decoded[..MASTER_KEY_LEN]);
        master_salt.copy_from_slice(&decoded[MASTER_KEY_LEN..KEYING_MATERIAL_LEN]);

        Ok(Self {
            master_key,
            master_salt,
        })
    }

    pub fn to_base64(&self) -> String {
        let mut raw = [0u8; KEYING_MATERIAL_LEN];
        raw[..MASTER_KEY_LEN].copy_from_slice(&self.master_key);
        raw[MASTER_KEY_LEN..].copy_from_slice(&self.master_salt);
        base64::engine::general_purpose::STANDARD.encode(raw)
    }
}

impl fmt::Debug for KeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyingMaterial(..)")
    }
}

/// Derived session keys for one of SRTP or SRTCP.
#[derive(Clone)]
struct SessionKeys {
    cipher_key: [u8; 16],
    auth_key: [u8; 20], // HMAC-SHA1 uses 160-bit key
    salt: [u8; 14],
}

impl SessionKeys {
    fn derive(material: &KeyingMaterial, labels: [u8; 3]) -> Self {
        Self {
            cipher_key: prf_derive(&material.master_key, &material.master_salt, labels[0]),
            auth_key: prf_derive(&material.master_key, &material.master_salt, labels[1]),
            salt: prf_derive(&material.master_key, &material.master_salt, labels[2]),
        }
    }
}

/// Process-wide crypto engine handle.
///
/// Created once by the application bootstrap and handed to every session
/// that may encrypt. Holding one proves the self-test passed.
#[derive(Debug)]
pub struct SrtpEngine {
    _initialized: (),
}

impl SrtpEngine {
    /// Initialize the engine, validating key derivation against the
    /// RFC 3711 appendix B.3 test vectors.
    pub fn init() -> Result<Self> {
        const MASTER_KEY: [u8; 16] = [
            0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE,
            0x41, 0x39,
        ];
        const MASTER_SALT: [u8; 14] = [
            0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
        ];
        const CIPHER_KEY: [u8; 16] = [
            0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE, 0x3F, 0xF7,
            0xA0, 0x87,
        ];
        const CIPHER_SALT: [u8; 14] = [
            0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, 0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A, 0xE1,
        ];
        const AUTH_KEY: [u8; 20] = [
            0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, 0x6F, 0xD4, 0xAB, 0x49, 0xAF, 0x25,
            0x6A, 0x15, 0x6D, 0x38, 0xBA, 0xA4,
        ];

        let keys = SessionKeys::derive(
            &KeyingMaterial {
                master_key: MASTER_KEY,
                master_salt: MASTER_SALT,
            },
            [LABEL_CIPHER_KEY, LABEL_AUTH_KEY, LABEL_SALT],
        );
        if keys.cipher_key != CIPHER_KEY || keys.salt != CIPHER_SALT || keys.auth_key != AUTH_KEY
        {
            bail!("SRTP key derivation self-test failed");
        }

        tracing::debug!("SRTP engine initialized");
        Ok(Self { _initialized: () })
    }

    /// Draw fresh master key material from the OS CSPRNG.
    pub fn generate_material(&self) -> Result<KeyingMaterial> {
        let mut raw = [0u8; KEYING_MATERIAL_LEN];
        getrandom::getrandom(&mut raw).map_err(|e| anyhow!("OS CSPRNG failed: {}", e))?;
        let mut master_key = [0u8; MASTER_KEY_LEN];
        let mut master_salt = [0u8; MASTER_SALT_LEN];
        master_key.copy_from_slice(&raw[..MASTER_KEY_LEN]);
        master_salt.copy_from_slice(&raw[MASTER_KEY_LEN..]);
        Ok(KeyingMaterial {
            master_key,
            master_salt,
        })
    }

    /// Build a context from known material.
    ///
    /// `ssrc` pins the context to one outbound stream; packets with another
    /// SSRC are refused by [`CryptoContext::protect`].
    pub fn create_context(
        &self,
        tag: u32,
        suite: CryptoSuite,
        material: KeyingMaterial,
        ssrc: Option<u32>,
    ) -> CryptoContext {
        let rtp_keys =
            SessionKeys::derive(&material, [LABEL_CIPHER_KEY, LABEL_AUTH_KEY, LABEL_SALT]);
        let rtcp_keys = SessionKeys::derive(
            &material,
            [LABEL_SRTCP_CIPHER_KEY, LABEL_SRTCP_AUTH_KEY, LABEL_SRTCP_SALT],
        );
        CryptoContext {
            tag,
            suite,
            material,
            ssrc,
            rtp_keys,
            rtcp_keys,
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Create a local candidate with freshly generated keys.
    pub fn create_local_context(
        &self,
        tag: u32,
        suite: CryptoSuite,
        ssrc: u32,
    ) -> Result<CryptoContext> {
        let material = self.generate_material()?;
        Ok(self.create_context(tag, suite, material, Some(ssrc)))
    }

    /// Parse an SDES crypto attribute into a remote context.
    ///
    /// Accepts `a=crypto:<tag> <suite> inline:<key||salt>[|lifetime][|mki:len]`
    /// with or without the `a=` prefix.
    pub fn parse_crypto_line(&self, line: &str) -> Result<CryptoContext> {
        let line = line.trim();
        let rest = line
            .strip_prefix("a=crypto:")
            .or_else(|| line.strip_prefix("crypto:"))
            .with_context(|| format!("not a crypto line: {}", line))?;

        let mut parts = rest.split_whitespace();
        let tag: u32 = parts
            .next()
            .context("malformed crypto line")?
            .parse()
            .context("bad crypto tag")?;
        let suite_name = parts.next().context("crypto line has no suite")?;
        let suite = CryptoSuite::from_name(suite_name)
            .with_context(|| format!("unsupported crypto suite: {}", suite_name))?;
        let key_params = parts.next().context("crypto line has no key params")?;
        let key_part = key_params
            .strip_prefix("inline:")
            .context("no inline: key in crypto line")?;

        // Key is everything up to the first '|' or end of string
        let b64_key = key_part.split('|').next().unwrap_or(key_part);
        let material = KeyingMaterial::from_base64(b64_key)?;

        Ok(self.create_context(tag, suite, material, None))
    }
}

/// Rollover and index tracking for one direction of one stream.
#[derive(Debug, Default)]
struct StreamState {
    roc: u32,
    highest_seq: u16,
    seen_any: bool,
    srtcp_index: u32,
}

impl StreamState {
    /// Estimate the sender's ROC for an inbound sequence number (RFC 3711 appendix A).
    fn estimate_roc(&self, seq: u16) -> u32 {
        if !self.seen_any {
            return self.roc;
        }
        let s_l = self.highest_seq as i32;
        let seq = seq as i32;
        if s_l < 0x8000 {
            if seq - s_l > 0x8000 {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        } else if s_l - 0x8000 > seq {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    fn accept(&mut self, roc: u32, seq: u16) {
        if !self.seen_any {
            self.seen_any = true;
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc.wrapping_add(1) {
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc && seq > self.highest_seq {
            self.highest_seq = seq;
        }
    }
}

/// One SRTP crypto line: suite, keys, and stream state.
pub struct CryptoContext {
    tag: u32,
    suite: CryptoSuite,
    material: KeyingMaterial,
    ssrc: Option<u32>,
    rtp_keys: SessionKeys,
    rtcp_keys: SessionKeys,
    state: Mutex<StreamState>,
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("tag", &self.tag)
            .field("suite", &self.suite)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

impl CryptoContext {
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    /// Render as an SDES attribute for the signaling layer.
    pub fn to_crypto_line(&self) -> String {
        format!(
            "a=crypto:{} {} inline:{}|2^31",
            self.tag,
            self.suite.name(),
            self.material.to_base64()
        )
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encrypt a framed RTP packet in place and append the auth tag.
    ///
    /// Layout afterwards: RTP header || encrypted payload || auth tag.
    pub fn protect(&self, packet: &mut Vec<u8>) -> Result<()> {
        let header_len =
            rtp::full_header_len(packet).context("RTP packet too short for SRTP protection")?;

        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        if let Some(expected) = self.ssrc {
            if ssrc != expected {
                bail!("SSRC {:#010x} not bound to this crypto context", ssrc);
            }
        }

        let mut state = self.lock_state();
        let roc = state.roc;

        let iv = build_iv(&self.rtp_keys.salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new((&self.rtp_keys.cipher_key).into(), &iv.into());
        cipher.apply_keystream(&mut packet[header_len..]);

        // Auth tag over header || encrypted payload || ROC
        let auth_tag = compute_auth_tag(&self.rtp_keys.auth_key, packet, Some(roc))?;
        packet.extend_from_slice(&auth_tag[..self.suite.rtp_tag_len()]);

        if seq == 0xFFFF {
            state.roc = state.roc.wrapping_add(1);
        }
        Ok(())
    }

    /// Verify and decrypt an SRTP packet in place, removing the auth tag.
    pub fn unprotect(&self, packet: &mut Vec<u8>) -> Result<()> {
        let tag_len = self.suite.rtp_tag_len();
        if packet.len() < rtp::RTP_HEADER_SIZE + tag_len {
            bail!("SRTP packet too short: {} bytes", packet.len());
        }

        let auth_tag_offset = packet.len() - tag_len;
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);

        let mut state = self.lock_state();
        let roc = state.estimate_roc(seq);

        let expected_tag =
            compute_auth_tag(&self.rtp_keys.auth_key, &packet[..auth_tag_offset], Some(roc))?;
        if packet[auth_tag_offset..] != expected_tag[..tag_len] {
            bail!("SRTP auth tag mismatch");
        }

        let header_len = rtp::full_header_len(&packet[..auth_tag_offset])
            .context("SRTP packet has truncated RTP header")?;

        let iv = build_iv(&self.rtp_keys.salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new((&self.rtp_keys.cipher_key).into(), &iv.into());
        cipher.apply_keystream(&mut packet[header_len..auth_tag_offset]);
        packet.truncate(auth_tag_offset);

        state.accept(roc, seq);
        Ok(())
    }

    /// Encrypt an RTCP compound packet in place (RFC 3711 §3.4).
    ///
    /// Layout afterwards: header(8) || encrypted payload || E||index(4) || tag(10).
    pub fn protect_rtcp(&self, packet: &mut Vec<u8>) -> Result<()> {
        if packet.len() < RTCP_HEADER_SIZE {
            bail!("RTCP packet too short for SRTCP protection");
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        let mut state = self.lock_state();
        let index = state.srtcp_index;

        if packet.len() > RTCP_HEADER_SIZE {
            let iv = build_srtcp_iv(&self.rtcp_keys.salt, ssrc, index);
            let mut cipher = Aes128Ctr::new((&self.rtcp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut packet[RTCP_HEADER_SIZE..]);
        }

        let e_index: u32 = 0x8000_0000 | (index & 0x7FFF_FFFF);
        packet.extend_from_slice(&e_index.to_be_bytes());

        let auth_tag = compute_auth_tag(&self.rtcp_keys.auth_key, packet, None)?;
        packet.extend_from_slice(&auth_tag[..SRTCP_AUTH_TAG_LEN]);

        state.srtcp_index = index.wrapping_add(1) & 0x7FFF_FFFF;
        Ok(())
    }

    /// Verify and decrypt an SRTCP packet in place.
    pub fn unprotect_rtcp(&self, packet: &mut Vec<u8>) -> Result<()> {
        if packet.len() < RTCP_HEADER_SIZE + SRTCP_INDEX_LEN + SRTCP_AUTH_TAG_LEN {
            bail!("SRTCP packet too short: {} bytes", packet.len());
        }

        let auth_tag_offset = packet.len() - SRTCP_AUTH_TAG_LEN;
        let expected_tag =
            compute_auth_tag(&self.rtcp_keys.auth_key, &packet[..auth_tag_offset], None)?;
        if packet[auth_tag_offset..] != expected_tag[..SRTCP_AUTH_TAG_LEN] {
            bail!("SRTCP auth tag mismatch");
        }

        let ei_offset = auth_tag_offset - SRTCP_INDEX_LEN;
        let e_index = u32::from_be_bytes([
            packet[ei_offset],
            packet[ei_offset + 1],
            packet[ei_offset + 2],
            packet[ei_offset + 3],
        ]);
        let encrypted = (e_index & 0x8000_0000) != 0;
        let srtcp_index = e_index & 0x7FFF_FFFF;
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        if encrypted && ei_offset > RTCP_HEADER_SIZE {
            let iv = build_srtcp_iv(&self.rtcp_keys.salt, ssrc, srtcp_index);
            let mut cipher = Aes128Ctr::new((&self.rtcp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut packet[RTCP_HEADER_SIZE..ei_offset]);
        }
        packet.truncate(ei_offset);

        let mut state = self.lock_state();
        if srtcp_index >= state.srtcp_index {
            state.srtcp_index = srtcp_index.wrapping_add(1) & 0x7FFF_FFFF;
        }
        Ok(())
    }
}

/// PRF for key derivation: AES-128-CM with label and index=0 (RFC 3711, 4.3.1).
fn prf_derive<const N: usize>(
    master_key: &[u8; MASTER_KEY_LEN],
    master_salt: &[u8; MASTER_SALT_LEN],
    label: u8,
) -> [u8; N] {
    // x = label at byte 7 of a 14-byte field; IV = (master_salt XOR x) || 0x0000
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;

    let mut output = [0u8; N];
    let mut cipher = Aes128Ctr::new(master_key.into(), &iv.into());
    cipher.apply_keystream(&mut output);
    output
}

/// IV = (session_salt XOR (SSRC || ROC || SEQ)) padded to 16 bytes (RFC 3711, 4.1.1).
fn build_iv(salt: &[u8; 14], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[8..12].copy_from_slice(&roc.to_be_bytes());
    iv[12..14].copy_from_slice(&seq.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

/// SRTCP IV: the index sits right-aligned in the 48-bit packet index field.
fn build_srtcp_iv(salt: &[u8; 14], ssrc: u32, srtcp_index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[10..14].copy_from_slice(&srtcp_index.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

/// Full 160-bit HMAC-SHA1 over the authenticated portion (and ROC for SRTP).
fn compute_auth_tag(
    auth_key: &[u8; 20],
    authenticated_portion: &[u8],
    roc: Option<u32>,
) -> Result<Vec<u8>> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(auth_key)
        .map_err(|e| anyhow!("HMAC key rejected: {}", e))?;
    mac.update(authenticated_portion);
    if let Some(roc) = roc {
        mac.update(&roc.to_be_bytes());
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacket;

    fn make_test_material() -> KeyingMaterial {
        let mut master_key = [0u8; 16];
        let mut master_salt = [0u8; 14];
        for (i, b) in master_key.iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in master_salt.iter_mut().enumerate() {
            *b = (16 + i) as u8;
        }
        KeyingMaterial {
            master_key,
            master_salt,
        }
    }

    fn pair(suite: CryptoSuite) -> (CryptoContext, CryptoContext) {
        let engine = SrtpEngine::init().unwrap();
        (
            engine.create_context(1, suite, make_test_material(), Some(0xDEADBEEF)),
            engine.create_context(1, suite, make_test_material(), None),
        )
    }

    fn rtp_bytes(seq: u16) -> Vec<u8> {
        RtpPacket::new(0xDEADBEEF, seq, 160, 0, false)
            .with_payload(&[0xFF; 160])
            .serialize(SRTP_MAX_TRAILER_LEN)
    }

    #[test]
    fn test_engine_self_test_passes() {
        assert!(SrtpEngine::init().is_ok());
    }

    #[test]
    fn test_parse_crypto_line() {
        let engine = SrtpEngine::init().unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode([0xABu8; 30]);
        let line = format!("a=crypto:2 AES_CM_128_HMAC_SHA1_32 inline:{}|2^31|1:1", b64);
        let ctx = engine.parse_crypto_line(&line).unwrap();
        assert_eq!(ctx.tag(), 2);
        assert_eq!(ctx.suite(), CryptoSuite::AesCm128HmacSha1_32);
        assert_eq!(ctx.material.master_key, [0xAB; 16]);
        assert_eq!(ctx.material.master_salt, [0xAB; 14]);
    }

    #[test]
    fn test_parse_crypto_line_rejects_unknown_suite() {
        let engine = SrtpEngine::init().unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8; 30]);
        let line = format!("a=crypto:1 AEAD_AES_256_GCM inline:{}", b64);
        assert!(engine.parse_crypto_line(&line).is_err());
        assert!(engine.parse_crypto_line("a=rtpmap:0 PCMU/8000").is_err());
    }

    #[test]
    fn test_crypto_line_renders_and_parses_back() {
        let engine = SrtpEngine::init().unwrap();
        let local = engine
            .create_local_context(1, CryptoSuite::AesCm128HmacSha1_80, 42)
            .unwrap();
        let line = local.to_crypto_line();
        assert!(line.starts_with("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

        let remote = engine.parse_crypto_line(&line).unwrap();
        let mut pkt = RtpPacket::new(42, 5, 0, 0, false)
            .with_payload(b"hello")
            .serialize(SRTP_MAX_TRAILER_LEN);
        let plain = pkt.clone();
        local.protect(&mut pkt).unwrap();
        remote.unprotect(&mut pkt).unwrap();
        assert_eq!(pkt, plain);
    }

    #[test]
    fn test_protect_unprotect_80() {
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_80);
        let plain = rtp_bytes(1);
        let mut pkt = plain.clone();
        tx.protect(&mut pkt).unwrap();
        assert_eq!(pkt.len(), plain.len() + 10);
        assert_eq!(&pkt[..12], &plain[..12], "header stays in the clear");
        assert_ne!(&pkt[12..plain.len()], &plain[12..]);

        rx.unprotect(&mut pkt).unwrap();
        assert_eq!(pkt, plain);
    }

    #[test]
    fn test_protect_unprotect_32() {
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_32);
        let plain = rtp_bytes(7);
        let mut pkt = plain.clone();
        tx.protect(&mut pkt).unwrap();
        assert_eq!(pkt.len(), plain.len() + 4);
        rx.unprotect(&mut pkt).unwrap();
        assert_eq!(pkt, plain);
    }

    #[test]
    fn test_auth_tag_mismatch() {
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_80);
        let mut pkt = rtp_bytes(1);
        tx.protect(&mut pkt).unwrap();
        let len = pkt.len();
        pkt[len - 1] ^= 0xFF;
        assert!(rx.unprotect(&mut pkt).is_err());
    }

    #[test]
    fn test_protect_refuses_foreign_ssrc() {
        let (tx, _) = pair(CryptoSuite::AesCm128HmacSha1_80);
        let mut pkt = RtpPacket::new(1, 1, 1, 0, false).with_payload(&[0]).serialize(0);
        assert!(tx.protect(&mut pkt).is_err());
    }

    #[test]
    fn test_rollover_across_sequence_wrap() {
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_80);
        for seq in [0xFFFEu16, 0xFFFF, 0x0000, 0x0001] {
            let plain = rtp_bytes(seq);
            let mut pkt = plain.clone();
            tx.protect(&mut pkt).unwrap();
            rx.unprotect(&mut pkt).unwrap();
            assert_eq!(pkt, plain, "seq {}", seq);
        }
        assert_eq!(tx.lock_state().roc, 1);
        assert_eq!(rx.lock_state().roc, 1);
    }

    /// Minimal RTCP Sender Report: 8-byte header + 20-byte sender info.
    fn make_test_rtcp_sr(ssrc: u32) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x80;
        pkt[1] = 200;
        pkt[3] = 6;
        pkt[4..8].copy_from_slice(&ssrc.to_be_bytes());
        pkt
    }

    #[test]
    fn test_srtcp_keys_differ_from_srtp() {
        let (tx, _) = pair(CryptoSuite::AesCm128HmacSha1_80);
        assert_ne!(tx.rtp_keys.cipher_key, tx.rtcp_keys.cipher_key);
        assert_ne!(tx.rtp_keys.auth_key, tx.rtcp_keys.auth_key);
        assert_ne!(tx.rtp_keys.salt, tx.rtcp_keys.salt);
    }

    #[test]
    fn test_protect_unprotect_rtcp() {
        // SRTCP keeps an 80-bit tag even for the _32 suite
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_32);
        let plain = make_test_rtcp_sr(0xCAFEBABE);
        let mut pkt = plain.clone();
        tx.protect_rtcp(&mut pkt).unwrap();
        assert_eq!(pkt.len(), plain.len() + SRTP_MAX_TRAILER_LEN);
        assert_eq!(&pkt[..8], &plain[..8]);
        assert_ne!(&pkt[8..28], &plain[8..28]);

        rx.unprotect_rtcp(&mut pkt).unwrap();
        assert_eq!(pkt, plain);
    }

    #[test]
    fn test_srtcp_auth_tag_mismatch() {
        let (tx, rx) = pair(CryptoSuite::AesCm128HmacSha1_80);
        let mut pkt = make_test_rtcp_sr(0xDEADC0DE);
        tx.protect_rtcp(&mut pkt).unwrap();
        let len = pkt.len();
        pkt[len - 1] ^= 0xFF;
        assert!(rx.unprotect_rtcp(&mut pkt).is_err());
    }
}
