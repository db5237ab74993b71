//! Framed AES-256-GCM for artifact streams.
//!
//! AES-GCM authenticates whole messages, so the byte stream is cut into
//! frames of at most [`CHUNK_SIZE`] plaintext bytes, each sealed with its own
//! random nonce. Wire format per frame:
//!
//! ```text
//! u32 (big-endian) ciphertext length | 12-byte nonce | ciphertext + tag
//! ```
//!
//! Truncation or bit-flips surface as decryption failures; whole-artifact
//! integrity is additionally covered by the checksum recorded on the job.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// GCM authentication tag length
const TAG_SIZE: usize = 16;

/// Maximum plaintext bytes per frame
pub const CHUNK_SIZE: usize = 64 * 1024;

const MAX_FRAME_LEN: usize = CHUNK_SIZE + TAG_SIZE;

fn cipher_from_key(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

fn crypto_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

// ── FrameEncryptWriter ──

/// AsyncWrite adapter that seals the stream into encrypted frames.
pub struct FrameEncryptWriter<W> {
    inner: W,
    cipher: Aes256Gcm,
    /// Plaintext accumulating toward one frame
    buf: Vec<u8>,
    /// Encoded frame bytes waiting to drain into `inner`
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<W: AsyncWrite + Unpin> FrameEncryptWriter<W> {
    pub fn new(inner: W, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: cipher_from_key(key),
            buf: Vec::with_capacity(CHUNK_SIZE),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Seal the current plaintext buffer into `pending`.
    fn seal(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, self.buf.as_slice())
            .map_err(|_| crypto_err("encryption failure"))?;
        self.buf.clear();

        self.pending.clear();
        self.pending_pos = 0;
        self.pending
            .extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        self.pending.extend_from_slice(&nonce_bytes);
        self.pending.extend_from_slice(&ciphertext);
        Ok(())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "destination closed while writing encrypted frame",
                )));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FrameEncryptWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = &mut *self;
        loop {
            ready!(me.poll_drain(cx))?;
            if me.buf.len() >= CHUNK_SIZE {
                me.seal()?;
                continue;
            }
            break;
        }
        let take = (CHUNK_SIZE - me.buf.len()).min(buf.len());
        me.buf.extend_from_slice(&buf[..take]);
        if me.buf.len() == CHUNK_SIZE {
            // Prepared now, drained on the next poll
            me.seal()?;
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        loop {
            ready!(me.poll_drain(cx))?;
            if !me.buf.is_empty() {
                me.seal()?;
                continue;
            }
            break;
        }
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── FrameDecryptReader ──

enum ReadState {
    Header,
    Frame,
}

/// AsyncRead adapter that opens encrypted frames back into plaintext.
pub struct FrameDecryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    state: ReadState,
    header: [u8; 4],
    filled: usize,
    frame: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameDecryptReader<R> {
    pub fn new(inner: R, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: cipher_from_key(key),
            state: ReadState::Header,
            header: [0u8; 4],
            filled: 0,
            frame: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            eof: false,
        }
    }

    fn decrypt_frame(&mut self) -> std::io::Result<()> {
        let (nonce_bytes, ciphertext) = self.frame.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.out = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| crypto_err("decryption failed: wrong key or corrupted frame"))?;
        self.out_pos = 0;
        self.state = ReadState::Header;
        self.filled = 0;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FrameDecryptReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        loop {
            // Serve decrypted plaintext first
            if me.out_pos < me.out.len() {
                let n = (me.out.len() - me.out_pos).min(dst.remaining());
                dst.put_slice(&me.out[me.out_pos..me.out_pos + n]);
                me.out_pos += n;
                return Poll::Ready(Ok(()));
            }
            if me.eof {
                return Poll::Ready(Ok(()));
            }

            match me.state {
                ReadState::Header => {
                    let mut header = me.header;
                    let mut buf = ReadBuf::new(&mut header[me.filled..]);
                    ready!(Pin::new(&mut me.inner).poll_read(cx, &mut buf))?;
                    let n = buf.filled().len();
                    me.header = header;
                    if n == 0 {
                        if me.filled == 0 {
                            me.eof = true;
                            continue;
                        }
                        return Poll::Ready(Err(crypto_err(
                            "truncated artifact: partial frame header",
                        )));
                    }
                    me.filled += n;
                    if me.filled == 4 {
                        let len = u32::from_be_bytes(me.header) as usize;
                        if len < TAG_SIZE || len > MAX_FRAME_LEN {
                            return Poll::Ready(Err(crypto_err(
                                "corrupted artifact: implausible frame length",
                            )));
                        }
                        me.frame = vec![0u8; NONCE_SIZE + len];
                        me.filled = 0;
                        me.state = ReadState::Frame;
                    }
                }
                ReadState::Frame => {
                    let filled = me.filled;
                    let mut buf = ReadBuf::new(&mut me.frame[filled..]);
                    ready!(Pin::new(&mut me.inner).poll_read(cx, &mut buf))?;
                    let n = buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(crypto_err(
                            "truncated artifact: partial encrypted frame",
                        )));
                    }
                    me.filled += n;
                    if me.filled == me.frame.len() {
                        me.decrypt_frame()?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY: [u8; 32] = [42u8; 32];

    async fn encrypt(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
        let mut sink = Vec::new();
        let mut writer = FrameEncryptWriter::new(&mut sink, key);
        writer.write_all(data).await.unwrap();
        writer.shutdown().await.unwrap();
        sink
    }

    async fn decrypt(data: &[u8], key: &[u8; 32]) -> std::io::Result<Vec<u8>> {
        let mut reader = FrameDecryptReader::new(data, key);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn roundtrip_small_and_multi_frame() {
        for size in [0usize, 1, 1000, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE + 17] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let sealed = encrypt(&data, &KEY).await;
            let opened = decrypt(&sealed, &KEY).await.unwrap();
            assert_eq!(opened, data, "size {}", size);
        }
    }

    #[tokio::test]
    async fn ciphertext_is_larger_and_differs_from_plaintext() {
        let data = b"pos_sales rows".to_vec();
        let sealed = encrypt(&data, &KEY).await;
        assert!(sealed.len() > data.len());
        assert!(!sealed.windows(data.len()).any(|w| w == data.as_slice()));
    }

    #[tokio::test]
    async fn tampered_frame_fails_to_decrypt() {
        let data = vec![7u8; 1024];
        let mut sealed = encrypt(&data, &KEY).await;
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;
        assert!(decrypt(&sealed, &KEY).await.is_err());
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let sealed = encrypt(b"secret", &KEY).await;
        let other = [43u8; 32];
        assert!(decrypt(&sealed, &other).await.is_err());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let sealed = encrypt(&vec![1u8; 500], &KEY).await;
        let cut = &sealed[..sealed.len() - 3];
        assert!(decrypt(cut, &KEY).await.is_err());
    }
}
