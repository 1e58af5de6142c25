//! Measured stream decorator
//!
//! Wraps a bidirectional stream and counts the bytes moved in each
//! direction. The counters are shared atomics, so a connection handler can
//! keep reading them after the stream has been split or consumed by the
//! relay.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream decorator that counts bytes per direction.
///
/// Every successful read adds to `read_bytes`, every successful write adds
/// to `write_bytes`. All other stream semantics pass through untouched.
pub struct MeteredStream<S> {
    inner: S,
    read_bytes: Arc<AtomicU64>,
    write_bytes: Arc<AtomicU64>,
}

impl<S> MeteredStream<S> {
    /// Wrap a stream with fresh counters
    pub fn new(inner: S) -> Self {
        Self::with_counters(
            inner,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        )
    }

    /// Wrap a stream, accumulating into caller-provided counters
    pub fn with_counters(
        inner: S,
        read_bytes: Arc<AtomicU64>,
        write_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            read_bytes,
            write_bytes,
        }
    }

    /// Handles to the (read, write) counters
    pub fn counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (self.read_bytes.clone(), self.write_bytes.clone())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            this.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }

        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);

        if let Poll::Ready(Ok(n)) = result {
            this.write_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }

        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counts_both_directions() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut metered = MeteredStream::new(client);
        let (read_count, write_count) = metered.counters();

        metered.write_all(b"ping!").await.unwrap();
        metered.flush().await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"pong pong").await.unwrap();

        let mut buf = [0u8; 9];
        metered.read_exact(&mut buf).await.unwrap();

        assert_eq!(write_count.load(Ordering::Relaxed), 5);
        assert_eq!(read_count.load(Ordering::Relaxed), 9);
    }

    #[tokio::test]
    async fn test_counters_survive_the_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let metered = MeteredStream::new(client);
        let (read_count, write_count) = metered.counters();

        let task = tokio::spawn(async move {
            let mut metered = metered;
            metered.write_all(b"abc").await.unwrap();
            metered.shutdown().await.unwrap();
        });

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        task.await.unwrap();

        assert_eq!(buf, b"abc");
        assert_eq!(write_count.load(Ordering::Relaxed), 3);
        assert_eq!(read_count.load(Ordering::Relaxed), 0);
    }
}
