//! Async HTCP client.
//!
//! One TCP connection is one logical channel: calls are strictly
//! sequential (concurrent callers serialize behind the connection
//! mutex), and a live [`SubscriptionStream`] *owns* the connection guard,
//! so a `call` issued while a subscription is active simply waits until
//! the stream is dropped or cancelled.  There is no demultiplexer —
//! callers that need interleaving must open a second connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use htcp_protocol::aio;
use htcp_protocol::coerce;
use htcp_protocol::message::{
    Disconnect, ErrorMessage, HandshakeRequest, HandshakeResponse, SubscribeData, SubscribeEnd,
    SubscribeError, SubscribeRequest, TransactionCall, TransactionResult, UnsubscribeRequest,
};
use htcp_protocol::wire::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, MAX_PAYLOAD_SIZE,
};
use htcp_protocol::{Arguments, Packet, PacketType, Schema, Value, WireError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ClientError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_payload_size: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

/// Snapshot of what the server told us at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_name: String,
    pub remote_addr: SocketAddr,
    /// Advertised transaction codes; empty when the server hides them.
    pub transactions: Vec<String>,
}

struct ClientConn {
    stream: TcpStream,
    connected: bool,
}

impl ClientConn {
    async fn send(&mut self, packet: &Packet, timeout: Option<Duration>) -> Result<(), WireError> {
        if !self.connected {
            return Err(WireError::Closed);
        }
        match aio::send_packet(&mut self.stream, packet, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_connection_error() {
                    self.connected = false;
                }
                Err(e)
            }
        }
    }

    async fn recv(
        &mut self,
        max_payload: usize,
        timeout: Option<Duration>,
    ) -> Result<Packet, WireError> {
        if !self.connected {
            return Err(WireError::Closed);
        }
        match aio::recv_packet(&mut self.stream, max_payload, timeout).await {
            Ok(packet) => Ok(packet),
            Err(e) => {
                if e.is_connection_error() {
                    self.connected = false;
                }
                Err(e)
            }
        }
    }
}

/// Connected async client.
pub struct Client {
    config: ClientConfig,
    conn: Arc<Mutex<ClientConn>>,
    info: ServerInfo,
}

impl Client {
    /// Open the TCP stream and complete the handshake.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Client, ClientError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout("connect"))?
            .map_err(WireError::Io)?;
        let remote_addr = stream.peer_addr().map_err(WireError::Io)?;
        let mut conn = ClientConn {
            stream,
            connected: true,
        };

        conn.send(&HandshakeRequest.to_packet(), config.write_timeout)
            .await?;
        let packet = conn
            .recv(config.max_payload_size, config.read_timeout)
            .await?;
        let response = match packet.packet_type {
            PacketType::HandshakeResponse => HandshakeResponse::from_packet(&packet)?,
            PacketType::Error => {
                let error = ErrorMessage::from_packet(&packet)?;
                return Err(ClientError::Handshake(error.message));
            }
            other => return Err(ClientError::UnexpectedPacket(other.as_byte())),
        };

        info!(
            server_name = %response.server_name,
            %remote_addr,
            transactions = response.transactions.len(),
            "connected"
        );
        Ok(Client {
            config,
            conn: Arc::new(Mutex::new(conn)),
            info: ServerInfo {
                server_name: response.server_name,
                remote_addr,
                transactions: response.transactions,
            },
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn server_name(&self) -> &str {
        &self.info.server_name
    }

    pub fn transactions(&self) -> &[String] {
        &self.info.transactions
    }

    /// Call a transaction and wait for its reply.
    pub async fn call(
        &self,
        transaction: &str,
        arguments: Arguments,
    ) -> Result<Value, ClientError> {
        let mut conn = self.conn.lock().await;
        let call = TransactionCall {
            transaction: transaction.to_owned(),
            arguments,
        };
        conn.send(&call.to_packet(), self.config.write_timeout)
            .await?;
        debug!(transaction, "transaction call sent");

        let packet = conn
            .recv(self.config.max_payload_size, self.config.read_timeout)
            .await?;
        drop(conn);

        match packet.packet_type {
            PacketType::TransactionResult => {
                let result = TransactionResult::from_packet(&packet)?;
                if result.success {
                    Ok(result.result)
                } else {
                    Err(ClientError::Call {
                        code: transaction.to_owned(),
                        error_code: result.error_code,
                        message: result.error_message,
                    })
                }
            }
            PacketType::Error => {
                let error = ErrorMessage::from_packet(&packet)?;
                Err(ClientError::Server {
                    error_code: error.error_code,
                    message: error.message,
                })
            }
            other => Err(ClientError::UnexpectedPacket(other.as_byte())),
        }
    }

    /// Call a transaction and coerce the result to a declared schema.
    pub async fn call_with_schema(
        &self,
        transaction: &str,
        arguments: Arguments,
        schema: &Schema,
    ) -> Result<Value, ClientError> {
        let result = self.call(transaction, arguments).await?;
        Ok(coerce::coerce(result, schema)?)
    }

    /// Open a subscription stream.
    ///
    /// The returned handle holds the connection until it ends, is
    /// cancelled, or is dropped; dropping before the stream ends sends a
    /// best-effort unsubscribe.
    pub async fn subscribe(
        &self,
        event_type: &str,
        arguments: Arguments,
    ) -> Result<SubscriptionStream, ClientError> {
        self.subscribe_inner(event_type, arguments, None).await
    }

    /// Like [`Client::subscribe`], coercing every data payload.
    pub async fn subscribe_with_schema(
        &self,
        event_type: &str,
        arguments: Arguments,
        schema: Schema,
    ) -> Result<SubscriptionStream, ClientError> {
        self.subscribe_inner(event_type, arguments, Some(schema)).await
    }

    async fn subscribe_inner(
        &self,
        event_type: &str,
        arguments: Arguments,
        schema: Option<Schema>,
    ) -> Result<SubscriptionStream, ClientError> {
        let mut guard = Arc::clone(&self.conn).lock_owned().await;
        let subscription_id = Uuid::new_v4().to_string();
        let request = SubscribeRequest {
            subscription_id: subscription_id.clone(),
            event_type: event_type.to_owned(),
            arguments,
        };
        guard
            .send(&request.to_packet(), self.config.write_timeout)
            .await?;
        info!(event_type, subscription_id = %subscription_id, "subscribed");

        Ok(SubscriptionStream {
            guard: Some(guard),
            conn: Arc::clone(&self.conn),
            config: self.config.clone(),
            subscription_id,
            event_type: event_type.to_owned(),
            schema,
            ended: false,
            cancelled: false,
        })
    }

    /// Best-effort disconnect notification, then close the stream.
    pub async fn close(self) {
        let mut conn = self.conn.lock().await;
        if conn.connected {
            let _ = conn
                .send(&Disconnect.to_packet(), self.config.write_timeout)
                .await;
            conn.connected = false;
        }
        let _ = conn.stream.shutdown().await;
        info!("disconnected");
    }
}

/// Live subscription handle: an async pull-iterator over data packets.
///
/// While this handle exists it owns the connection guard, which is what
/// makes calls and subscriptions mutually exclusive on one connection.
/// Subscription reads wait indefinitely — a quiet stream is not an error
/// (the server likewise lifts its read timeout for subscribed clients).
pub struct SubscriptionStream {
    guard: Option<OwnedMutexGuard<ClientConn>>,
    conn: Arc<Mutex<ClientConn>>,
    config: ClientConfig,
    subscription_id: String,
    event_type: String,
    schema: Option<Schema>,
    ended: bool,
    cancelled: bool,
}

impl SubscriptionStream {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Pull the next data payload.  `None` means the stream ended
    /// (subscribe-end, cancellation, or connection close).
    pub async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        if self.ended || self.cancelled {
            return None;
        }
        let conn = self.guard.as_mut()?;
        let packet = match conn.recv(self.config.max_payload_size, None).await {
            Ok(packet) => packet,
            Err(WireError::Closed) => {
                self.finish();
                return None;
            }
            Err(e) => {
                self.finish();
                return Some(Err(e.into()));
            }
        };

        match packet.packet_type {
            PacketType::SubscribeData => match SubscribeData::from_packet(&packet) {
                Ok(data) if data.subscription_id == self.subscription_id => {
                    match &self.schema {
                        Some(schema) => {
                            Some(coerce::coerce(data.data, schema).map_err(ClientError::from))
                        }
                        None => Some(Ok(data.data)),
                    }
                }
                Ok(data) => {
                    self.finish();
                    debug!(
                        got = %data.subscription_id,
                        expected = %self.subscription_id,
                        "data for a different subscription"
                    );
                    Some(Err(ClientError::UnexpectedPacket(
                        packet.packet_type.as_byte(),
                    )))
                }
                Err(e) => {
                    self.finish();
                    Some(Err(e.into()))
                }
            },
            PacketType::SubscribeEnd => {
                self.ended = true;
                self.release();
                match SubscribeEnd::from_packet(&packet) {
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
            PacketType::SubscribeError => {
                self.ended = true;
                self.release();
                match SubscribeError::from_packet(&packet) {
                    Ok(error) => Some(Err(ClientError::Subscription {
                        error_code: error.error_code,
                        message: error.message,
                    })),
                    Err(e) => Some(Err(e.into())),
                }
            }
            PacketType::Error => {
                self.finish();
                match ErrorMessage::from_packet(&packet) {
                    Ok(error) => Some(Err(ClientError::Server {
                        error_code: error.error_code,
                        message: error.message,
                    })),
                    Err(e) => Some(Err(e.into())),
                }
            }
            other => {
                self.finish();
                Some(Err(ClientError::UnexpectedPacket(other.as_byte())))
            }
        }
    }

    /// Collect the remaining payloads until the stream ends or fails.
    pub async fn collect(mut self) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Explicitly cancel: send unsubscribe (best-effort) and release the
    /// connection.
    pub async fn cancel(&mut self) {
        if self.ended || self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(conn) = self.guard.as_mut() {
            let request = UnsubscribeRequest {
                subscription_id: self.subscription_id.clone(),
            };
            let _ = conn
                .send(&request.to_packet(), self.config.write_timeout)
                .await;
            debug!(subscription_id = %self.subscription_id, "unsubscribed");
        }
        self.release();
    }

    fn finish(&mut self) {
        self.ended = true;
        self.cancelled = true;
        self.release();
    }

    fn release(&mut self) {
        self.guard = None;
    }
}

impl Drop for SubscriptionStream {
    /// Cancel-on-drop: a handle abandoned mid-stream still unsubscribes,
    /// so the server-side producer does not linger until connection
    /// close.
    fn drop(&mut self) {
        if self.ended || self.cancelled {
            return;
        }
        self.release();
        let conn = Arc::clone(&self.conn);
        let packet = UnsubscribeRequest {
            subscription_id: self.subscription_id.clone(),
        }
        .to_packet();
        let write_timeout = self.config.write_timeout;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut conn = conn.lock().await;
                let _ = conn.send(&packet, write_timeout).await;
            });
        }
    }
}
