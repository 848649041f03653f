//! Per-chunk authenticator/AEAD dispatch.
//!
//! A tagged union rather than a trait object: the chunk hot path only ever
//! sees one of four cases per connection, decided once at pipeline
//! construction, so a `match` here is cheaper than dynamic dispatch per
//! chunk (matching the "pipeline polymorphism" shape used for
//! `VmessSecurity`-style dispatch elsewhere in this codebase's AEAD code).

use aes_gcm::{aead::Aead as _, Aes128Gcm, KeyInit as _, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};

use crate::vmess::protocol::fnv1a_hash;

/// The FNV-1a tag length prepended by [`ChunkAuthenticator::Fnv`].
pub const FNV_TAG_LEN: usize = 4;
/// Tag length for both real AEADs used here (AES-128-GCM, ChaCha20-Poly1305).
pub const AEAD_TAG_LEN: usize = 16;
/// Nonce length both real AEADs declare.
pub const AEAD_NONCE_LEN: usize = 12;

/// Unifies the four per-chunk sealing strategies the body pipelines use.
pub enum ChunkAuthenticator {
    /// Zero overhead: the chunk passes through unchanged. Used for
    /// `SecurityType::None` with packet transfer.
    NoOp,
    /// Pseudo-AEAD: the "tag" is a 4-byte FNV-1a-32 of the plaintext,
    /// prepended on seal and verified-then-stripped on open. Used by
    /// LEGACY chunked mode.
    Fnv,
    Aes128Gcm(Box<Aes128Gcm>),
    Chacha20Poly1305(Box<ChaCha20Poly1305>),
}

impl ChunkAuthenticator {
    pub fn tag_len(&self) -> usize {
        match self {
            ChunkAuthenticator::NoOp => 0,
            ChunkAuthenticator::Fnv => FNV_TAG_LEN,
            ChunkAuthenticator::Aes128Gcm(_) | ChunkAuthenticator::Chacha20Poly1305(_) => {
                AEAD_TAG_LEN
            }
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            ChunkAuthenticator::NoOp | ChunkAuthenticator::Fnv => 0,
            ChunkAuthenticator::Aes128Gcm(_) | ChunkAuthenticator::Chacha20Poly1305(_) => {
                AEAD_NONCE_LEN
            }
        }
    }

    pub fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            ChunkAuthenticator::NoOp => Ok(plaintext.to_vec()),
            ChunkAuthenticator::Fnv => {
                let tag = fnv1a_hash(plaintext);
                let mut out = Vec::with_capacity(FNV_TAG_LEN + plaintext.len());
                out.extend_from_slice(&tag.to_be_bytes());
                out.extend_from_slice(plaintext);
                Ok(out)
            }
            ChunkAuthenticator::Aes128Gcm(aead) => aead
                .encrypt(AesNonce::from_slice(nonce), plaintext)
                .map_err(|e| std::io::Error::other(format!("AES-128-GCM seal failed: {e}"))),
            ChunkAuthenticator::Chacha20Poly1305(aead) => aead
                .encrypt(ChaChaNonce::from_slice(nonce), plaintext)
                .map_err(|e| {
                    std::io::Error::other(format!("ChaCha20-Poly1305 seal failed: {e}"))
                }),
        }
    }

    pub fn open(&self, nonce: &[u8], sealed: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            ChunkAuthenticator::NoOp => Ok(sealed.to_vec()),
            ChunkAuthenticator::Fnv => {
                if sealed.len() < FNV_TAG_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "chunk shorter than FNV tag",
                    ));
                }
                let (tag_bytes, plaintext) = sealed.split_at(FNV_TAG_LEN);
                let expected = u32::from_be_bytes(tag_bytes.try_into().unwrap());
                if fnv1a_hash(plaintext) != expected {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "FNV chunk tag mismatch",
                    ));
                }
                Ok(plaintext.to_vec())
            }
            ChunkAuthenticator::Aes128Gcm(aead) => aead
                .decrypt(AesNonce::from_slice(nonce), sealed)
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "AES-128-GCM tag mismatch")
                }),
            ChunkAuthenticator::Chacha20Poly1305(aead) => aead
                .decrypt(ChaChaNonce::from_slice(nonce), sealed)
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "ChaCha20-Poly1305 tag mismatch",
                    )
                }),
        }
    }
}
