//! Bidirectional relay
//!
//! Copies two directions of a proxied connection concurrently. A clean EOF
//! on one direction half-closes its peer writer and lets the other
//! direction keep running; the first error aborts the whole relay.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay buffer size per direction (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Relay data between a client and a target until both directions are done.
///
/// Returns `(client_to_target, target_to_client)` plaintext byte counts on
/// success. The first non-EOF error on either direction aborts the other
/// direction and is returned; the caller tears both streams down.
pub async fn relay<CR, CW, TR, TW>(
    client_read: CR,
    client_write: CW,
    target_read: TR,
    target_write: TW,
) -> io::Result<(u64, u64)>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    let upload = copy_direction(client_read, target_write);
    let download = copy_direction(target_read, client_write);

    // try_join drops the surviving direction as soon as one errors, which
    // is what aborts the relay.
    tokio::try_join!(upload, download)
}

/// Copy one direction to completion, then signal end-of-stream to the peer
async fn copy_direction<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
    buf.resize(RELAY_BUFFER_SIZE, 0);
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Clean EOF: propagate the half-close so the peer can observe
            // end-of-stream, but keep the other direction alive.
            writer.shutdown().await?;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_echo() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (target_near, mut target_far) = tokio::io::duplex(1024);

        let (cr, cw) = tokio::io::split(client_near);
        let (tr, tw) = tokio::io::split(target_near);
        let relay_task = tokio::spawn(relay(cr, cw, tr, tw));

        // Target echoes whatever arrives.
        let echo_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let n = target_far.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                target_far.write_all(&buf[..n]).await.unwrap();
            }
            target_far.shutdown().await.unwrap();
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_far);
        client_write.write_all(b"echo me").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"echo me");

        echo_task.await.unwrap();
        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!(up, 7);
        assert_eq!(down, 7);
    }

    #[tokio::test]
    async fn test_clean_eof_half_closes_only_one_direction() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (target_near, mut target_far) = tokio::io::duplex(1024);

        let (cr, cw) = tokio::io::split(client_near);
        let (tr, tw) = tokio::io::split(target_near);
        let relay_task = tokio::spawn(relay(cr, cw, tr, tw));

        let mut client_far = client_far;

        // Client closes its sending side immediately.
        client_far.shutdown().await.unwrap();

        // Target sees EOF but can still send data back.
        let mut buf = [0u8; 16];
        let n = target_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        target_far.write_all(b"late data").await.unwrap();
        target_far.shutdown().await.unwrap();

        let mut out = Vec::new();
        client_far.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"late data");

        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!(up, 0);
        assert_eq!(down, 9);
    }
}
