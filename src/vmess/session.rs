//! The server session: request-header decode, response-header encode, and
//! body-pipeline selection, tied together behind the state machine in
//! `SessionState`.

use std::sync::Arc;

use aes_gcm::{Aes128Gcm, KeyInit as _};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use crate::vmess::cfb::{CfbDecryptReader, CfbEncryptWriter};
use crate::vmess::chunk::{ChunkReader, ChunkWriter};
use crate::vmess::cipher::{ChunkAuthenticator, AEAD_NONCE_LEN};
use crate::vmess::error::VmessError;
use crate::vmess::nonce::ChunkNonceGenerator;
use crate::vmess::protocol::{
    derive_chacha20_key, derive_response_key_iv, fnv1a_hash, header_iv, normalize_security,
    Command, DestAddress, RequestOptions, SecurityType, SessionFingerprint, VERSION,
};
use crate::vmess::request::{RequestDescriptor, SessionCryptoState};
use crate::vmess::response::ResponseDescriptor;
use crate::vmess::session_history::SessionHistory;
use crate::vmess::size::{ChunkSizeCodec, PlainSizeCodec, ShakeSizeCodec};
use crate::vmess::user::UserDirectory;

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x02;
const ADDR_TYPE_IPV6: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Fresh,
    HeaderDecoded,
    ResponseHeaderEncoded,
}

/// One VMess server-side connection. Constructed per accepted connection;
/// holds borrowed references to the user directory and the shared session
/// history, and owns its own key material once decoded.
pub struct ServerSession<'a> {
    user_directory: &'a dyn UserDirectory,
    session_history: Arc<SessionHistory>,
    state: SessionState,
    crypto: Option<SessionCryptoState>,
    response_crypto: Option<([u8; 16], [u8; 16])>,
}

impl<'a> ServerSession<'a> {
    pub fn new(user_directory: &'a dyn UserDirectory, session_history: Arc<SessionHistory>) -> Self {
        Self {
            user_directory,
            session_history,
            state: SessionState::Fresh,
            crypto: None,
            response_crypto: None,
        }
    }

    /// Decodes the request header, returning the descriptor and the
    /// original (un-decrypted) reader so the caller can build the body
    /// pipeline with [`select_body_reader`]. Panics if called more than
    /// once on the same session — out-of-order calls are a programmer
    /// error, not a wire error.
    pub async fn decode_request_header<R>(
        &mut self,
        mut reader: R,
    ) -> Result<(RequestDescriptor, R), VmessError>
    where
        R: AsyncRead + Unpin,
    {
        assert_eq!(
            self.state,
            SessionState::Fresh,
            "decode_request_header called out of order"
        );

        let mut auth_token = [0u8; 16];
        reader.read_exact(&mut auth_token).await?;

        let (user, timestamp) = self
            .user_directory
            .lookup(&auth_token)
            .ok_or(VmessError::InvalidUser)?;

        let iv = header_iv(timestamp);
        let mut decrypting = CfbDecryptReader::new(reader, &user.cmd_key, &iv);

        let mut checksum_input = Vec::with_capacity(64);

        let mut header = [0u8; 41];
        decrypting.read_exact(&mut header).await?;
        checksum_input.extend_from_slice(&header);

        let version = header[0];
        if version != VERSION {
            return Err(VmessError::InvalidVersion(version));
        }

        let mut request_body_iv = [0u8; 16];
        request_body_iv.copy_from_slice(&header[1..17]);
        let mut request_body_key = [0u8; 16];
        request_body_key.copy_from_slice(&header[17..33]);
        let response_header_byte = header[33];
        let options = RequestOptions(header[34]);
        let pad_len = (header[35] >> 4) as usize;
        let security = normalize_security(header[35] & 0x0F)?;
        // header[36] is reserved and intentionally left unread.
        // An unrecognized command byte defaults to TCP rather than
        // erroring — the wire format never validates this field either.
        let command = Command::from_byte(header[37]).unwrap_or(Command::Tcp);
        let port = u16::from_be_bytes([header[38], header[39]]);
        let addr_type = header[40];

        let fingerprint = SessionFingerprint {
            user: user.handle,
            key: request_body_key,
            nonce: request_body_iv,
        };
        if self.session_history.has(&fingerprint).await {
            warn!("vmess request header rejected: replayed fingerprint");
            return Err(VmessError::Replay);
        }

        let address = match addr_type {
            ADDR_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                decrypting.read_exact(&mut octets).await?;
                checksum_input.extend_from_slice(&octets);
                DestAddress::V4(octets)
            }
            ADDR_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                decrypting.read_exact(&mut octets).await?;
                checksum_input.extend_from_slice(&octets);
                DestAddress::V6(octets)
            }
            ADDR_TYPE_DOMAIN => {
                let mut len_byte = [0u8; 1];
                decrypting.read_exact(&mut len_byte).await?;
                checksum_input.extend_from_slice(&len_byte);
                let len = len_byte[0];
                if len == 0 {
                    return Err(VmessError::ZeroLengthDomain);
                }
                let mut name = vec![0u8; len as usize];
                decrypting.read_exact(&mut name).await?;
                checksum_input.extend_from_slice(&name);
                let name = String::from_utf8_lossy(&name).into_owned();
                DestAddress::Domain(name)
            }
            _ => return Err(VmessError::InvalidAddress),
        };

        if pad_len > 0 {
            let mut padding = vec![0u8; pad_len];
            decrypting.read_exact(&mut padding).await?;
            checksum_input.extend_from_slice(&padding);
        }

        let mut checksum_bytes = [0u8; 4];
        decrypting.read_exact(&mut checksum_bytes).await?;
        let expected = u32::from_be_bytes(checksum_bytes);
        if fnv1a_hash(&checksum_input) != expected {
            warn!("vmess request header failed checksum verification");
            return Err(VmessError::InvalidAuth);
        }

        // Deferred per the recommended replay policy: a fingerprint is only
        // ever admitted once its header has fully verified.
        self.session_history.add(fingerprint).await;

        let descriptor = RequestDescriptor {
            version,
            user_handle: user.handle,
            options,
            security,
            command,
            port,
            address,
        };

        self.crypto = Some(SessionCryptoState {
            request_body_key,
            request_body_iv,
            response_header_byte,
        });
        self.state = SessionState::HeaderDecoded;

        debug!(
            security = ?descriptor.security,
            command = ?descriptor.command,
            port = descriptor.port,
            "vmess request header decoded"
        );

        Ok((descriptor, decrypting.into_inner()))
    }

    /// Derives the response key/IV, writes the encrypted response header
    /// through a fresh CFB writer over `writer`, and returns that writer so
    /// the caller can hand it to [`select_body_writer`] (directly, for
    /// LEGACY reuse, or via `.into_inner()` for every other mode). Panics if
    /// called before `decode_request_header` or more than once.
    pub async fn encode_response_header<W>(
        &mut self,
        writer: W,
        response: &ResponseDescriptor,
    ) -> Result<CfbEncryptWriter<W>, VmessError>
    where
        W: AsyncWrite + Unpin,
    {
        assert_eq!(
            self.state,
            SessionState::HeaderDecoded,
            "encode_response_header called out of order"
        );
        let crypto = self
            .crypto
            .as_ref()
            .expect("HeaderDecoded state implies crypto is set");

        let (response_body_key, response_body_iv) =
            derive_response_key_iv(&crypto.request_body_key, &crypto.request_body_iv);

        let mut out = CfbEncryptWriter::new(writer, &response_body_key, &response_body_iv);

        let mut plaintext = Vec::with_capacity(2 + 2);
        plaintext.push(crypto.response_header_byte);
        plaintext.push(response.option);
        plaintext.extend(response.marshal_command());

        out.write_all_encrypted(&plaintext).await?;

        self.response_crypto = Some((response_body_key, response_body_iv));
        self.state = SessionState::ResponseHeaderEncoded;

        Ok(out)
    }
}

fn size_codec(options: RequestOptions, seed: &[u8; 16]) -> Box<dyn ChunkSizeCodec> {
    if options.has_chunk_masking() {
        Box::new(ShakeSizeCodec::new(seed))
    } else {
        Box::new(PlainSizeCodec)
    }
}

/// Selects the body reader pipeline per the security/option/command table.
/// `reader` is the plain reader handed back by `decode_request_header`.
pub fn select_body_reader<R>(
    descriptor: &RequestDescriptor,
    crypto: &SessionCryptoState,
    reader: R,
) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match descriptor.security {
        SecurityType::None if !descriptor.options.has_chunk_stream() => Box::new(reader),
        SecurityType::None => {
            let codec = size_codec(descriptor.options, &crypto.request_body_iv);
            Box::new(ChunkReader::new(reader, ChunkAuthenticator::NoOp, None, codec))
        }
        SecurityType::Legacy if !descriptor.options.has_chunk_stream() => Box::new(
            CfbDecryptReader::new(reader, &crypto.request_body_key, &crypto.request_body_iv),
        ),
        SecurityType::Legacy => {
            let cfb = CfbDecryptReader::new(reader, &crypto.request_body_key, &crypto.request_body_iv);
            let codec = size_codec(descriptor.options, &crypto.request_body_iv);
            Box::new(ChunkReader::new(cfb, ChunkAuthenticator::Fnv, None, codec))
        }
        SecurityType::Aes128Gcm => {
            let aead = Aes128Gcm::new_from_slice(&crypto.request_body_key)
                .expect("16-byte key is always valid for AES-128-GCM");
            let nonce_gen = ChunkNonceGenerator::new(&crypto.request_body_iv, AEAD_NONCE_LEN);
            let codec = size_codec(descriptor.options, &crypto.request_body_iv);
            Box::new(ChunkReader::new(
                reader,
                ChunkAuthenticator::Aes128Gcm(Box::new(aead)),
                Some(nonce_gen),
                codec,
            ))
        }
        SecurityType::Chacha20Poly1305 => {
            let key32 = derive_chacha20_key(&crypto.request_body_key);
            let aead = ChaCha20Poly1305::new_from_slice(&key32)
                .expect("32-byte key is always valid for ChaCha20-Poly1305");
            let nonce_gen = ChunkNonceGenerator::new(&crypto.request_body_iv, AEAD_NONCE_LEN);
            let codec = size_codec(descriptor.options, &crypto.request_body_iv);
            Box::new(ChunkReader::new(
                reader,
                ChunkAuthenticator::Chacha20Poly1305(Box::new(aead)),
                Some(nonce_gen),
                codec,
            ))
        }
    }
}

/// Selects the body writer pipeline per the security/option table. `writer`
/// is whatever `encode_response_header` returned: pass the `CfbEncryptWriter`
/// itself for LEGACY (its keystream continues across the header write), or
/// `.into_inner()` of it for every other mode.
pub fn select_body_writer<W>(
    descriptor: &RequestDescriptor,
    response_body_key: &[u8; 16],
    response_body_iv: &[u8; 16],
    writer: W,
) -> Box<dyn AsyncWrite + Unpin + Send>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match descriptor.security {
        SecurityType::None if !descriptor.options.has_chunk_stream() => Box::new(writer),
        SecurityType::None => {
            let codec = size_codec(descriptor.options, response_body_iv);
            Box::new(ChunkWriter::new(writer, ChunkAuthenticator::NoOp, None, codec))
        }
        SecurityType::Legacy if !descriptor.options.has_chunk_stream() => Box::new(writer),
        SecurityType::Legacy => {
            let codec = size_codec(descriptor.options, response_body_iv);
            Box::new(ChunkWriter::new(writer, ChunkAuthenticator::Fnv, None, codec))
        }
        SecurityType::Aes128Gcm => {
            let aead = Aes128Gcm::new_from_slice(response_body_key)
                .expect("16-byte key is always valid for AES-128-GCM");
            let nonce_gen = ChunkNonceGenerator::new(response_body_iv, AEAD_NONCE_LEN);
            let codec = size_codec(descriptor.options, response_body_iv);
            Box::new(ChunkWriter::new(
                writer,
                ChunkAuthenticator::Aes128Gcm(Box::new(aead)),
                Some(nonce_gen),
                codec,
            ))
        }
        SecurityType::Chacha20Poly1305 => {
            let key32 = derive_chacha20_key(response_body_key);
            let aead = ChaCha20Poly1305::new_from_slice(&key32)
                .expect("32-byte key is always valid for ChaCha20-Poly1305");
            let nonce_gen = ChunkNonceGenerator::new(response_body_iv, AEAD_NONCE_LEN);
            let codec = size_codec(descriptor.options, response_body_iv);
            Box::new(ChunkWriter::new(
                writer,
                ChunkAuthenticator::Chacha20Poly1305(Box::new(aead)),
                Some(nonce_gen),
                codec,
            ))
        }
    }
}

impl<'a> ServerSession<'a> {
    /// Convenience accessor for callers that need the response key/IV pair
    /// (e.g. to call `select_body_writer`) without re-deriving it.
    pub fn response_crypto(&self) -> Option<([u8; 16], [u8; 16])> {
        self.response_crypto
    }
}
