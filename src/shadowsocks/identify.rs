//! Cipher-trial identification
//!
//! A server carries one cipher per access key, with no user identifier on
//! the wire. A new connection is attributed to a key by attempting to
//! authenticate its first length frame against each cipher in order.
//!
//! Bytes pulled from the socket during a failed trial cannot be re-fetched,
//! so every trial reads through a [`ReplayTee`]: a reader that first replays
//! a growing buffer, then tees fresh socket bytes into it for later trials.
//! On success the buffer is replayed once more into the selected cipher so
//! its stream state starts from byte zero.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use crate::error::{Error, Result};

use super::{CipherList, ShadowReader};

/// Replay-then-tee reader used for cipher trials.
///
/// Reads deliver `buffer[pos..]` first; once the buffer is exhausted, reads
/// fall through to the inner stream. In tee mode every fresh byte is
/// appended to the buffer so a later trial can replay it.
pub struct ReplayTee<R> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
    tee: bool,
}

impl<R> ReplayTee<R> {
    /// Create a trial reader: replay `buffer`, then tee new bytes into it
    pub fn new(inner: R, buffer: Vec<u8>) -> Self {
        Self {
            inner,
            buffer,
            pos: 0,
            tee: true,
        }
    }

    /// Create a plain replay reader: replay `buffer`, then pass through
    pub fn replay_only(inner: R, buffer: Vec<u8>) -> Self {
        Self {
            inner,
            buffer,
            pos: 0,
            tee: false,
        }
    }

    /// Recover the inner stream and the accumulated buffer
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buffer)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplayTee<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buffer.len() {
            let n = (this.buffer.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buffer[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = result {
            if this.tee {
                this.buffer.extend_from_slice(&buf.filled()[before..]);
                this.pos = this.buffer.len();
            }
        }

        result
    }
}

/// Select the cipher that authenticates the client stream.
///
/// Returns the selected index (the access key) and a plaintext reader whose
/// state is equivalent to a fresh reader over the original stream: the
/// buffered trial bytes are replayed and re-authenticated on first read.
///
/// A single-entry list is wrapped directly without a trial; the first real
/// read performs the authentication. An empty list fails before any byte is
/// read. End of stream during a trial aborts the search, since later
/// ciphers would have nothing left to authenticate against.
pub async fn identify<R>(
    reader: R,
    ciphers: &CipherList,
) -> Result<(usize, ShadowReader<ReplayTee<R>>)>
where
    R: AsyncRead + Unpin,
{
    if ciphers.is_empty() {
        return Err(Error::Config("Empty cipher list".to_string()));
    }

    if ciphers.len() == 1 {
        let cipher = ciphers
            .get(0)
            .cloned()
            .ok_or_else(|| Error::Config("Empty cipher list".to_string()))?;
        let replay = ReplayTee::replay_only(reader, Vec::new());
        return Ok((0, ShadowReader::new(replay, cipher)));
    }

    let mut inner = reader;
    let mut buffer = Vec::new();

    for (index, cipher) in ciphers.iter().enumerate() {
        debug!("trying cipher {}", index);

        let trial = ReplayTee::new(inner, buffer);
        let mut shadow = ShadowReader::new(trial, cipher.clone());

        match shadow.authenticate_header().await {
            Ok(()) => {
                debug!("selected cipher {}", index);
                // The trial bytes stay in the buffer; replay them into a
                // fresh reader so decryption restarts from byte zero.
                let (raw, replayed) = shadow.into_inner().into_parts();
                let replay = ReplayTee::replay_only(raw, replayed);
                return Ok((index, ShadowReader::new(replay, cipher.clone())));
            }
            Err(Error::AuthFailed) => {
                debug!("cipher {} failed authentication", index);
                let (raw, replayed) = shadow.into_inner().into_parts();
                inner = raw;
                buffer = replayed;
            }
            // EOF or a transport error: no later cipher can be tested.
            Err(e) => return Err(e),
        }
    }

    Err(Error::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::{Cipher, ShadowWriter};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn list(entries: &[&str]) -> CipherList {
        CipherList::from_entries(entries).unwrap()
    }

    async fn encrypt(cipher: &Arc<Cipher>, plaintext: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        {
            let mut writer = ShadowWriter::new(&mut wire, cipher.clone());
            writer.write_all(plaintext).await.unwrap();
            writer.flush().await.unwrap();
        }
        wire
    }

    #[tokio::test]
    async fn test_replay_tee_replays_then_tees() {
        let trailing: &[u8] = b" world";
        let mut tee = ReplayTee::new(trailing, b"hello".to_vec());

        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");

        // Fresh bytes were appended for the next trial.
        let (_, buffer) = tee.into_parts();
        assert_eq!(buffer, b"hello world");
    }

    #[tokio::test]
    async fn test_replay_only_does_not_grow() {
        let trailing: &[u8] = b" world";
        let mut replay = ReplayTee::replay_only(trailing, b"hello".to_vec());

        let mut out = Vec::new();
        replay.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");

        let (_, buffer) = replay.into_parts();
        assert_eq!(buffer, b"hello");
    }

    #[tokio::test]
    async fn test_selects_matching_cipher_at_every_position() {
        let ciphers = list(&[
            "aes-128-gcm:alpha",
            "aes-256-gcm:bravo",
            "chacha20-ietf-poly1305:charlie",
        ]);
        let plaintext = b"the payload must survive every trial position";

        for expected in 0..ciphers.len() {
            let cipher = ciphers.get(expected).unwrap();
            let wire = encrypt(cipher, plaintext).await;

            let (index, mut reader) = identify(&wire[..], &ciphers).await.unwrap();
            assert_eq!(index, expected);

            // Byte preservation: the reader sees the exact stream a fresh
            // reader would, no matter how many trials consumed bytes.
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, plaintext);
        }
    }

    #[tokio::test]
    async fn test_single_cipher_skips_trial() {
        let ciphers = list(&["aes-256-gcm:solo"]);

        // A pending stream would block any read; the single-cipher path
        // must not touch the socket at identification time.
        let (client, _server) = tokio::io::duplex(64);
        let result = tokio::time::timeout(Duration::from_millis(100), async {
            identify(client, &ciphers).await
        })
        .await
        .expect("identification must not read from the stream");

        let (index, _reader) = result.unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_no_cipher_authenticates() {
        let ciphers = list(&["aes-128-gcm:alpha", "aes-256-gcm:bravo"]);
        // Enough random bytes for every trial's salt and length frame.
        let garbage = crate::crypto::random_bytes(64);

        match identify(&garbage[..], &ciphers).await {
            Err(Error::AuthFailed) => {}
            other => panic!("expected AuthFailed, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[tokio::test]
    async fn test_eof_during_trial_aborts() {
        let ciphers = list(&["aes-256-gcm:alpha", "aes-256-gcm:bravo"]);
        // Too short for even one salt: the first trial hits EOF and the
        // search stops instead of running the remaining ciphers.
        let short = vec![0u8; 16];

        match identify(&short[..], &ciphers).await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected EOF error, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[tokio::test]
    async fn test_empty_cipher_list_fails_fast() {
        let ciphers = CipherList::default();
        match identify(&b"anything"[..], &ciphers).await {
            Err(Error::Config(_)) => {}
            other => panic!("expected Config error, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_selects_lower_index() {
        // Both entries hold the same secret, so both authenticate; the
        // scan must deterministically pick the lower index.
        let ciphers = list(&["aes-256-gcm:same", "aes-256-gcm:same"]);
        let cipher = ciphers.get(1).unwrap();
        let wire = encrypt(cipher, b"ambiguous").await;

        let (index, mut reader) = identify(&wire[..], &ciphers).await.unwrap();
        assert_eq!(index, 0);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ambiguous");
    }
}
