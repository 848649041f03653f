//! AES-128-CFB streaming adapters: turn the block cipher into a byte-level
//! stream cipher wrapping an `AsyncRead`/`AsyncWrite`. Used for the header
//! decryptor (request-header decode) and for the LEGACY body pipeline.

use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aes::Aes128;
use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::KeyIvInit;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Decrypts bytes read from `inner` with AES-128-CFB as they pass through.
pub struct CfbDecryptReader<R> {
    inner: R,
    dec: BufDecryptor<Aes128>,
}

impl<R> CfbDecryptReader<R> {
    pub fn new(inner: R, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            inner,
            dec: BufDecryptor::new_from_slices(key, iv).expect("16-byte key/iv always valid"),
        }
    }

    /// Reclaims the wrapped reader, discarding the cipher state. Used once
    /// header decode is done and a later pipeline stage wants the plain
    /// underlying reader back (every non-LEGACY body pipeline).
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CfbDecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.dec.decrypt(&mut buf.filled_mut()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Encrypts bytes with AES-128-CFB before writing them to `inner`.
///
/// A whole `poll_write` call's buffer is enciphered in one shot (CFB's
/// keystream only depends on prior ciphertext, not on whether it has
/// reached the socket yet) and then drained from a pending buffer across
/// as many `inner.poll_write` calls as a partial write demands, so the
/// cipher state never advances past bytes that failed to go out.
pub struct CfbEncryptWriter<W> {
    inner: W,
    enc: BufEncryptor<Aes128>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<W> CfbEncryptWriter<W> {
    pub fn new(inner: W, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            inner,
            enc: BufEncryptor::new_from_slices(key, iv).expect("16-byte key/iv always valid"),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Encrypts and writes `data` to completion. Used for the response
    /// header, which is always written as one short, complete plaintext
    /// block before any chunked body writes begin.
    pub async fn write_all_encrypted(&mut self, data: &[u8]) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = data.to_vec();
        self.enc.encrypt(&mut buf);
        use tokio::io::AsyncWriteExt;
        self.inner.write_all(&buf).await
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Reclaims the wrapped writer, discarding the cipher state. Used by
    /// every non-LEGACY body pipeline once the response header has been
    /// flushed through this writer once.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CfbEncryptWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_pos >= this.pending.len() {
            let mut encrypted = buf.to_vec();
            this.enc.encrypt(&mut encrypted);
            this.pending = encrypted;
            this.pending_pos = 0;
        }

        while this.pending_pos < this.pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending[this.pending_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "write returned 0",
                    )))
                }
                Poll::Ready(Ok(n)) => this.pending_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.len();
        this.pending.clear();
        this.pending_pos = 0;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
