//! Async packet transport over tokio streams.
//!
//! Mirrors the blocking `transport` module with per-call timeouts: each
//! send/recv accepts an `Option<Duration>`; `None` waits indefinitely
//! (the server lifts the read timeout once a connection holds an active
//! subscription).

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::wire::{Packet, HEADER_SIZE};

/// Send one packet as a single write followed by a flush.
pub async fn send_packet<W>(
    writer: &mut W,
    packet: &Packet,
    timeout: Option<Duration>,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes();
    with_timeout(timeout, "write", async {
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    })
    .await
}

/// Receive one packet.  The payload-length cap is enforced before any
/// payload byte is read; zero bytes at the header boundary signals
/// orderly close.
pub async fn recv_packet<R>(
    reader: &mut R,
    max_payload: usize,
    timeout: Option<Duration>,
) -> Result<Packet, WireError>
where
    R: AsyncRead + Unpin,
{
    with_timeout(timeout, "read", async {
        let mut header = [0u8; HEADER_SIZE];
        read_exact_counted(reader, &mut header, true).await?;
        let (packet_type, length) = Packet::parse_header(&header, max_payload)?;

        let mut payload = vec![0u8; length];
        if length > 0 {
            read_exact_counted(reader, &mut payload, false).await?;
        }
        Ok(Packet::new(packet_type, payload))
    })
    .await
}

async fn read_exact_counted<R>(
    reader: &mut R,
    buf: &mut [u8],
    orderly_close_ok: bool,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 && orderly_close_ok {
                return Err(WireError::Closed);
            }
            return Err(WireError::UnexpectedEof {
                got: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(())
}

async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    op: &'static str,
    fut: F,
) -> Result<T, WireError>
where
    F: Future<Output = Result<T, WireError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| WireError::Timeout(op))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{PacketType, MAX_PAYLOAD_SIZE};

    #[tokio::test]
    async fn roundtrip_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let packet = Packet::new(PacketType::SubscribeData, vec![1, 2, 3]);
        send_packet(&mut a, &packet, None).await.unwrap();
        let parsed = recv_packet(&mut b, MAX_PAYLOAD_SIZE, None).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn closed_pipe_is_orderly_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            recv_packet(&mut b, MAX_PAYLOAD_SIZE, None).await,
            Err(WireError::Closed)
        ));
    }

    #[tokio::test]
    async fn mid_header_close_reports_counts() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x48, 0x54]).await.unwrap();
        drop(a);
        match recv_packet(&mut b, MAX_PAYLOAD_SIZE, None).await {
            Err(WireError::UnexpectedEof { got: 2, expected }) => {
                assert_eq!(expected, HEADER_SIZE);
            }
            other => panic!("expected eof with counts, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_expires() {
        let (_a, mut b) = tokio::io::duplex(64);
        let result = recv_packet(&mut b, MAX_PAYLOAD_SIZE, Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(WireError::Timeout("read"))));
    }

    #[tokio::test]
    async fn oversize_length_rejected_before_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut bytes = Packet::empty(PacketType::TransactionCall).to_bytes();
        bytes[6..10].copy_from_slice(&u32::MAX.to_be_bytes());
        a.write_all(&bytes).await.unwrap();
        assert!(matches!(
            recv_packet(&mut b, MAX_PAYLOAD_SIZE, None).await,
            Err(WireError::PayloadTooLarge { .. })
        ));
    }
}
