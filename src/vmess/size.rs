//! Chunk-length codecs: a plain 16-bit big-endian length, or a Shake128
//! keystream mask applied to the same 16-bit length.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;

/// Encodes/decodes the on-the-wire chunk length prefix. Encoder and decoder
/// sides must each hold their own instance, seeded identically, and must
/// call it exactly once per chunk — the coupling between them is call order
/// alone, not any shared state beyond the seed.
pub trait ChunkSizeCodec: Send {
    fn encode_size(&mut self, size: u16) -> u16;
    fn decode_size(&mut self, masked: u16) -> u16;
}

/// No masking: the wire length prefix is the plaintext chunk length.
pub struct PlainSizeCodec;

impl ChunkSizeCodec for PlainSizeCodec {
    fn encode_size(&mut self, size: u16) -> u16 {
        size
    }

    fn decode_size(&mut self, masked: u16) -> u16 {
        masked
    }
}

/// XORs the length prefix against two fresh bytes pulled from a Shake128
/// stream seeded with the body IV. Unlike a fixed pre-filled buffer, the XOF
/// reader here is squeezed lazily and never repeats.
pub struct ShakeSizeCodec {
    reader: sha3::Shake128Reader,
}

impl ShakeSizeCodec {
    pub fn new(seed: &[u8]) -> Self {
        let mut hasher = Shake128::default();
        hasher.update(seed);
        Self {
            reader: hasher.finalize_xof(),
        }
    }

    fn next_mask(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.reader.read(&mut buf);
        u16::from_be_bytes(buf)
    }
}

impl ChunkSizeCodec for ShakeSizeCodec {
    fn encode_size(&mut self, size: u16) -> u16 {
        size ^ self.next_mask()
    }

    fn decode_size(&mut self, masked: u16) -> u16 {
        masked ^ self.next_mask()
    }
}
