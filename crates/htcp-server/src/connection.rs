//! Per-connection server-side state.
//!
//! The reader half stays with the connection task.  Writes go through a
//! bounded channel drained by one writer task per connection: the reply
//! path and any number of producer tasks enqueue whole packets, so a
//! producer aborted mid-send can never leave a partial frame on the
//! stream.  The writer drains what was enqueued, then shuts the socket
//! down when the last handle to the connection is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use htcp_protocol::aio;
use htcp_protocol::{Packet, WireError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;

/// Packets queued per connection before senders feel backpressure.
const WRITE_QUEUE_CAPACITY: usize = 64;

pub struct ConnectionHandle {
    addr: SocketAddr,
    tx: mpsc::Sender<Packet>,
    connected: AtomicBool,
    /// Lifted (set to `None`) once the connection holds an active
    /// subscription — a subscribed client is a silent reader.
    read_timeout: Mutex<Option<Duration>>,
}

impl ConnectionHandle {
    /// Build the handle and spawn its writer task.
    pub fn new(
        addr: SocketAddr,
        writer: OwnedWriteHalf,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Arc<ConnectionHandle> {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let handle = Arc::new(ConnectionHandle {
            addr,
            tx,
            connected: AtomicBool::new(true),
            read_timeout: Mutex::new(read_timeout),
        });
        tokio::spawn(writer_task(
            writer,
            rx,
            write_timeout,
            Arc::downgrade(&handle),
        ));
        handle
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock().expect("read timeout lock poisoned")
    }

    pub fn disable_read_timeout(&self) {
        *self.read_timeout.lock().expect("read timeout lock poisoned") = None;
    }

    /// Enqueue one packet for the writer.  Enqueueing is all-or-nothing,
    /// so cancellation between packets cannot tear a frame.
    pub async fn send(&self, packet: Packet) -> Result<(), WireError> {
        if !self.is_connected() {
            return Err(WireError::Closed);
        }
        self.tx.send(packet).await.map_err(|_| WireError::Closed)
    }

    /// Mark dead.  The writer drains what was already queued, then shuts
    /// the socket down once every handle is gone.
    pub fn close(&self) {
        self.mark_disconnected();
    }
}

async fn writer_task(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Packet>,
    write_timeout: Option<Duration>,
    handle: Weak<ConnectionHandle>,
) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = aio::send_packet(&mut writer, &packet, write_timeout).await {
            if let Some(conn) = handle.upgrade() {
                debug!(addr = %conn.addr, error = %e, "write failed, marking connection dead");
                conn.mark_disconnected();
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}
