//! Wire-level constants, enums, and pure byte-string primitives for the
//! VMess server session: FNV-1a-32, the MD5-based key/IV derivations, and
//! the address/command/security wire encodings. Nothing here touches I/O.

use md5::{Digest, Md5};

use crate::vmess::error::VmessError;

/// The only protocol version this codec accepts.
pub const VERSION: u8 = 1;

pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;

/// Command carried in the request header (offset 37).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            CMD_TCP => Some(Command::Tcp),
            CMD_UDP => Some(Command::Udp),
            _ => None,
        }
    }
}

/// Security mode (low nibble of offset 35, normalized).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    None,
    Legacy,
    Aes128Gcm,
    Chacha20Poly1305,
}

impl SecurityType {
    /// Normalizes the raw low nibble: `0` means "legacy" by convention,
    /// everything else maps directly. Returns `None` for a value with no
    /// mapping (a fatal invariant violation at pipeline-selection time).
    pub fn normalize(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(SecurityType::Legacy),
            0x01 => Some(SecurityType::Legacy),
            0x03 => Some(SecurityType::Aes128Gcm),
            0x04 => Some(SecurityType::Chacha20Poly1305),
            0x05 => Some(SecurityType::None),
            _ => None,
        }
    }
}

/// Options bitmask (offset 34). Unrecognized bits are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions(pub u8);

impl RequestOptions {
    pub const CHUNK_STREAM: u8 = 0x01;
    pub const CHUNK_MASKING: u8 = 0x04;

    pub fn has_chunk_stream(self) -> bool {
        self.0 & Self::CHUNK_STREAM != 0
    }

    pub fn has_chunk_masking(self) -> bool {
        self.0 & Self::CHUNK_MASKING != 0
    }
}

/// Destination address, tagged union over IPv4 / IPv6 / Domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddress {
    V4([u8; 4]),
    V6([u8; 16]),
    Domain(String),
}

/// The 48-byte replay-cache key: (user id, request body key, request body IV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionFingerprint {
    pub user: [u8; 16],
    pub key: [u8; 16],
    pub nonce: [u8; 16],
}

/// FNV-1a-32 over `data`, matching the wire checksum and the LEGACY chunk tag.
pub fn fnv1a_hash(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// `MD5(repeat(u64be(timestamp), 4))` — the header IV derived from the
/// client-declared time component returned by the user directory.
pub fn header_iv(timestamp: u64) -> [u8; 16] {
    let ts = timestamp.to_be_bytes();
    let mut hasher = Md5::new();
    for _ in 0..4 {
        hasher.update(ts);
    }
    let digest = hasher.finalize();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest);
    iv
}

/// `response_body_key = MD5(request_body_key)`,
/// `response_body_iv = MD5(request_body_iv)`.
pub fn derive_response_key_iv(body_key: &[u8; 16], body_iv: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let mut key = [0u8; 16];
    key.copy_from_slice(&Md5::digest(body_key));
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&Md5::digest(body_iv));
    (key, iv)
}

/// The 32-byte ChaCha20-Poly1305 key: `MD5(k) || MD5(MD5(k))`.
pub fn derive_chacha20_key(body_key: &[u8; 16]) -> [u8; 32] {
    let first = Md5::digest(body_key);
    let second = Md5::digest(first);
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&first);
    key[16..].copy_from_slice(&second);
    key
}

/// Normalizes a security nibble, surfacing the Open-Question-resolved
/// `UnsupportedSecurity` error instead of panicking.
pub fn normalize_security(raw: u8) -> Result<SecurityType, VmessError> {
    SecurityType::normalize(raw).ok_or(VmessError::UnsupportedSecurity(raw))
}
