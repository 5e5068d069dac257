//! Raw-socket helpers for wire-level integration tests.
//!
//! These deliberately bypass the client runtime so tests can assert
//! byte-exact behavior: send arbitrary (possibly malformed) bytes and
//! observe exactly what comes back.

use std::net::SocketAddr;
use std::time::Duration;

use htcp_protocol::aio;
use htcp_protocol::wire::MAX_PAYLOAD_SIZE;
use htcp_protocol::{Packet, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default per-step timeout for test I/O.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A raw TCP peer speaking hand-assembled bytes.
pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> RawPeer {
        let stream = timeout(STEP_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        RawPeer { stream }
    }

    /// Write raw bytes exactly as given.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        timeout(STEP_TIMEOUT, self.stream.write_all(bytes))
            .await
            .expect("write timed out")
            .expect("write failed");
        self.stream.flush().await.expect("flush failed");
    }

    /// Send a well-formed packet.
    pub async fn send_packet(&mut self, packet: &Packet) {
        self.send_bytes(&packet.to_bytes()).await;
    }

    /// Send a packet, tolerating a peer that already closed on us
    /// (admission-rejection races reset the stream mid-write).
    pub async fn try_send_packet(&mut self, packet: &Packet) -> std::io::Result<()> {
        timeout(STEP_TIMEOUT, self.stream.write_all(&packet.to_bytes()))
            .await
            .expect("write timed out")?;
        self.stream.flush().await
    }

    /// Receive one well-formed packet.
    pub async fn recv_packet(&mut self) -> Packet {
        timeout(
            STEP_TIMEOUT,
            aio::recv_packet(&mut self.stream, MAX_PAYLOAD_SIZE, None),
        )
        .await
        .expect("recv timed out")
        .expect("recv failed")
    }

    /// Receive one packet, returning the transport error instead of
    /// panicking; used to assert on orderly close.
    pub async fn try_recv_packet(&mut self) -> Result<Packet, WireError> {
        timeout(
            STEP_TIMEOUT,
            aio::recv_packet(&mut self.stream, MAX_PAYLOAD_SIZE, None),
        )
        .await
        .expect("recv timed out")
    }

    /// Read until the peer closes; returns whatever bytes arrived first.
    /// An immediate close yields an empty buffer.
    pub async fn read_until_close(&mut self) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match timeout(STEP_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
                Err(_) => panic!("peer did not close within {STEP_TIMEOUT:?}"),
            }
        }
        collected
    }
}

/// Assemble a header with arbitrary field values, bypassing validation.
/// Useful for malformed-input tests (wrong magic, absurd lengths).
pub fn raw_header(magic: &[u8; 4], version: u8, type_byte: u8, length: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(magic);
    header.push(version);
    header.push(type_byte);
    header.extend_from_slice(&length.to_be_bytes());
    header.extend_from_slice(&[0, 0]);
    header
}
