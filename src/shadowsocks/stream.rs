//! Shadowsocks AEAD framed streams
//!
//! Implements the chunk framing over any raw byte stream: a per-direction
//! salt followed by pairs of AEAD frames, one sealing the 2-byte big-endian
//! payload length and one sealing the payload itself.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{increment_nonce, random_bytes, MAX_PAYLOAD_LEN, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

use super::Cipher;

/// Size of an encrypted length frame on the wire
const LEN_FRAME_SIZE: usize = 2 + TAG_SIZE;

// ============================================================================
// Helper macro for poll_read pattern
// ============================================================================

macro_rules! poll_read_buf {
    ($inner:expr, $cx:expr, $buf:expr, $pos:expr) => {{
        let mut temp = ReadBuf::new(&mut $buf[$pos..]);
        match Pin::new(&mut $inner).poll_read($cx, &mut temp) {
            Poll::Ready(Ok(())) => temp.filled().len(),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }};
}

// ============================================================================
// State types
// ============================================================================

#[derive(Debug)]
enum ReadState {
    ReadingSalt { buf: Vec<u8>, pos: usize },
    ReadingLength { buf: [u8; LEN_FRAME_SIZE], pos: usize },
    ReadingPayload { len: usize, buf: Vec<u8>, pos: usize },
}

/// Outcome of driving the reader up to an authenticated frame header
enum HeaderEvent {
    /// A length frame authenticated; the stream is positioned at its payload
    Authenticated,
    /// Clean end of stream at a frame boundary
    Eof,
}

// ============================================================================
// ShadowReader
// ============================================================================

/// Decrypting side of a Shadowsocks stream.
///
/// Reads the salt, derives the session subkey, then yields the plaintext of
/// consecutive AEAD frames. A failed tag check surfaces as an error without
/// advancing past the failing frame.
pub struct ShadowReader<R> {
    inner: R,
    cipher: Arc<Cipher>,
    session: Option<crate::crypto::AeadCipher>,
    nonce: [u8; NONCE_SIZE],
    state: ReadState,

    // Decrypted payload not yet delivered to the caller
    out_buf: Vec<u8>,
    out_pos: usize,
}

impl<R> ShadowReader<R> {
    /// Create a reader over a raw byte stream for one cipher
    pub fn new(inner: R, cipher: Arc<Cipher>) -> Self {
        let salt_len = cipher.salt_len();
        Self {
            inner,
            cipher,
            session: None,
            nonce: [0u8; NONCE_SIZE],
            state: ReadState::ReadingSalt {
                buf: vec![0u8; salt_len],
                pos: 0,
            },
            out_buf: Vec::new(),
            out_pos: 0,
        }
    }

    /// Consume the reader and return the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn open(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "session cipher not ready"))?;
        match session.open(&self.nonce, ciphertext) {
            Ok(plaintext) => {
                increment_nonce(&mut self.nonce);
                Ok(plaintext)
            }
            Err(Error::AuthFailed) => Err(auth_failed_error()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl<R: AsyncRead + Unpin> ShadowReader<R> {
    /// Authenticate the next frame header without delivering any plaintext.
    ///
    /// Drives the stream through the salt and exactly one length frame. On
    /// success the stream is positioned at the start of that frame's
    /// payload; a later read re-delivers it in order. A tag failure returns
    /// [`Error::AuthFailed`]; end of stream surfaces as an IO error, so the
    /// two cases stay distinguishable for trial identification.
    pub async fn authenticate_header(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_header(cx, false))
            .await
            .map(|_| ())
            .map_err(|e| {
                if is_auth_failure(&e) {
                    Error::AuthFailed
                } else {
                    Error::Io(e)
                }
            })
    }

    /// Drive the state machine until a length frame has been authenticated.
    ///
    /// With `allow_clean_eof`, end of stream at a frame boundary reports
    /// [`HeaderEvent::Eof`] instead of an error.
    fn poll_header(
        &mut self,
        cx: &mut Context<'_>,
        allow_clean_eof: bool,
    ) -> Poll<io::Result<HeaderEvent>> {
        loop {
            match &mut self.state {
                ReadState::ReadingSalt { buf, pos } => {
                    let n = poll_read_buf!(self.inner, cx, buf, *pos);
                    if n == 0 {
                        if *pos == 0 && allow_clean_eof {
                            return Poll::Ready(Ok(HeaderEvent::Eof));
                        }
                        return Poll::Ready(Err(eof_error("salt")));
                    }
                    *pos += n;
                    if *pos < buf.len() {
                        continue;
                    }

                    let salt = std::mem::take(buf);
                    let session = self
                        .cipher
                        .session(&salt)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                    self.session = Some(session);
                    self.state = ReadState::ReadingLength {
                        buf: [0u8; LEN_FRAME_SIZE],
                        pos: 0,
                    };
                }

                ReadState::ReadingLength { buf, pos } => {
                    if *pos < LEN_FRAME_SIZE {
                        let n = poll_read_buf!(self.inner, cx, buf, *pos);
                        if n == 0 {
                            if *pos == 0 && allow_clean_eof {
                                return Poll::Ready(Ok(HeaderEvent::Eof));
                            }
                            return Poll::Ready(Err(eof_error("length frame")));
                        }
                        *pos += n;
                        if *pos < LEN_FRAME_SIZE {
                            continue;
                        }
                    }

                    // Leave the state untouched if the tag fails so the
                    // failing frame is not consumed.
                    let frame = *buf;
                    let plaintext = self.open(&frame)?;
                    if plaintext.len() != 2 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "malformed length frame",
                        )));
                    }
                    let len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
                    if len > MAX_PAYLOAD_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("payload length {} exceeds limit", len),
                        )));
                    }

                    self.state = ReadState::ReadingPayload {
                        len,
                        buf: vec![0u8; len + TAG_SIZE],
                        pos: 0,
                    };
                    return Poll::Ready(Ok(HeaderEvent::Authenticated));
                }

                ReadState::ReadingPayload { .. } => {
                    return Poll::Ready(Ok(HeaderEvent::Authenticated));
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ShadowReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // 1. Buffered plaintext from a previous frame
        if this.out_pos < this.out_buf.len() {
            let n = copy_to_buf(&this.out_buf[this.out_pos..], buf);
            this.out_pos += n;
            return Poll::Ready(Ok(()));
        }
        this.out_buf.clear();
        this.out_pos = 0;

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            // 2. Authenticate the next length frame
            match this.poll_header(cx, true) {
                Poll::Ready(Ok(HeaderEvent::Authenticated)) => {}
                Poll::Ready(Ok(HeaderEvent::Eof)) => return Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }

            // 3. Read and decrypt the payload frame
            match &mut this.state {
                ReadState::ReadingPayload { len, buf: pbuf, pos } => {
                    if *pos < pbuf.len() {
                        let n = poll_read_buf!(this.inner, cx, pbuf, *pos);
                        if n == 0 {
                            return Poll::Ready(Err(eof_error("payload frame")));
                        }
                        *pos += n;
                        if *pos < pbuf.len() {
                            continue;
                        }
                    }

                    let expected = *len;
                    let frame = std::mem::take(pbuf);
                    this.state = ReadState::ReadingLength {
                        buf: [0u8; LEN_FRAME_SIZE],
                        pos: 0,
                    };

                    let plaintext = match this.open(&frame) {
                        Ok(p) => p,
                        Err(e) => return Poll::Ready(Err(e)),
                    };
                    if plaintext.len() != expected {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "payload frame length mismatch",
                        )));
                    }
                    if plaintext.is_empty() {
                        continue;
                    }

                    let n = copy_to_buf(&plaintext, buf);
                    if n < plaintext.len() {
                        this.out_buf = plaintext;
                        this.out_pos = n;
                    }
                    return Poll::Ready(Ok(()));
                }
                _ => continue,
            }
        }
    }
}

// ============================================================================
// ShadowWriter
// ============================================================================

#[derive(Debug, Default)]
struct WriteBuffer {
    bytes: Vec<u8>,
    written: usize,
    /// Plaintext bytes the buffered frames account for
    consumed: usize,
}

/// Encrypting side of a Shadowsocks stream.
///
/// Emits the salt ahead of the first frame and fragments writes into frames
/// of at most [`MAX_PAYLOAD_LEN`] payload bytes. Whole frames are flushed to
/// the underlying stream before a write completes.
pub struct ShadowWriter<W> {
    inner: W,
    cipher: Arc<Cipher>,
    session: Option<crate::crypto::AeadCipher>,
    nonce: [u8; NONCE_SIZE],
    pending: WriteBuffer,
}

impl<W> ShadowWriter<W> {
    /// Create a writer over a raw byte stream for one cipher
    pub fn new(inner: W, cipher: Arc<Cipher>) -> Self {
        Self {
            inner,
            cipher,
            session: None,
            nonce: [0u8; NONCE_SIZE],
            pending: WriteBuffer::default(),
        }
    }

    /// Consume the writer and return the underlying stream
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn seal(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "session cipher not ready"))?;
        let ciphertext = session
            .seal(&self.nonce, plaintext)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        increment_nonce(&mut self.nonce);
        Ok(ciphertext)
    }

    /// Seal one chunk into the pending buffer, emitting the salt first if
    /// this is the first write on the stream.
    fn seal_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if self.session.is_none() {
            let salt = random_bytes(self.cipher.salt_len());
            let session = self
                .cipher
                .session(&salt)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.session = Some(session);
            self.pending.bytes.extend_from_slice(&salt);
        }

        let len_bytes = (data.len() as u16).to_be_bytes();
        let len_frame = self.seal(&len_bytes)?;
        self.pending.bytes.extend_from_slice(&len_frame);

        let payload_frame = self.seal(data)?;
        self.pending.bytes.extend_from_slice(&payload_frame);

        self.pending.consumed = data.len();
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> ShadowWriter<W> {
    /// Write buffered frames through to the underlying stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending.written < self.pending.bytes.len() {
            let n = match Pin::new(&mut self.inner)
                .poll_write(cx, &self.pending.bytes[self.pending.written..])
            {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write frame",
                )));
            }
            self.pending.written += n;
        }
        self.pending.bytes.clear();
        self.pending.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ShadowWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();

        if this.pending.bytes.is_empty() {
            let take = buf.len().min(MAX_PAYLOAD_LEN);
            this.seal_chunk(&buf[..take])?;
        }

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {
                let consumed = this.pending.consumed;
                this.pending.consumed = 0;
                Poll::Ready(Ok(consumed))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn eof_error(ctx: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed while reading {}", ctx),
    )
}

fn copy_to_buf(src: &[u8], dst: &mut ReadBuf<'_>) -> usize {
    let n = src.len().min(dst.remaining());
    dst.put_slice(&src[..n]);
    n
}

fn auth_failed_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, Error::AuthFailed)
}

/// Check whether an IO error carries a tag-verification failure
pub(crate) fn is_auth_failure(e: &io::Error) -> bool {
    e.get_ref()
        .map_or(false, |inner| matches!(inner.downcast_ref::<Error>(), Some(Error::AuthFailed)))
}
