//! Blocking HTCP client over a std TcpStream.
//!
//! Timeouts live on the socket (`set_read_timeout`/`set_write_timeout`).
//! The subscription handle borrows the client mutably, so the borrow
//! checker enforces the one-logical-channel rule: no calls while a
//! subscription is live.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use htcp_protocol::coerce;
use htcp_protocol::message::{
    Disconnect, ErrorMessage, HandshakeRequest, HandshakeResponse, SubscribeData, SubscribeEnd,
    SubscribeError, SubscribeRequest, TransactionCall, TransactionResult, UnsubscribeRequest,
};
use htcp_protocol::transport::{recv_packet, send_packet};
use htcp_protocol::{Arguments, Packet, PacketType, Schema, Value, WireError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{ClientConfig, ServerInfo};
use crate::ClientError;

pub struct BlockingClient {
    stream: TcpStream,
    config: ClientConfig,
    info: ServerInfo,
    connected: bool,
}

impl BlockingClient {
    /// Connect with the configured timeout and complete the handshake.
    pub fn connect(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<BlockingClient, ClientError> {
        let remote_addr = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&remote_addr, config.connect_timeout)
            .map_err(WireError::Io)?;
        stream
            .set_read_timeout(config.read_timeout)
            .map_err(WireError::Io)?;
        stream
            .set_write_timeout(config.write_timeout)
            .map_err(WireError::Io)?;

        let mut client = BlockingClient {
            stream,
            config,
            info: ServerInfo {
                server_name: String::new(),
                remote_addr,
                transactions: Vec::new(),
            },
            connected: true,
        };
        client.handshake()?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<(), ClientError> {
        self.send(&HandshakeRequest.to_packet())?;
        let packet = self.recv()?;
        match packet.packet_type {
            PacketType::HandshakeResponse => {
                let response = HandshakeResponse::from_packet(&packet)?;
                info!(server_name = %response.server_name, "connected");
                self.info.server_name = response.server_name;
                self.info.transactions = response.transactions;
                Ok(())
            }
            PacketType::Error => {
                let error = ErrorMessage::from_packet(&packet)?;
                Err(ClientError::Handshake(error.message))
            }
            other => Err(ClientError::UnexpectedPacket(other.as_byte())),
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn call(&mut self, transaction: &str, arguments: Arguments) -> Result<Value, ClientError> {
        let call = TransactionCall {
            transaction: transaction.to_owned(),
            arguments,
        };
        self.send(&call.to_packet())?;
        debug!(transaction, "transaction call sent");

        let packet = self.recv()?;
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

    pub fn call_with_schema(
        &mut self,
        transaction: &str,
        arguments: Arguments,
        schema: &Schema,
    ) -> Result<Value, ClientError> {
        let result = self.call(transaction, arguments)?;
        Ok(coerce::coerce(result, schema)?)
    }

    /// Open a subscription; the handle iterates data payloads.
    ///
    /// The socket read timeout is lifted for the life of the handle (a
    /// quiet stream is not an error) and restored when it drops.
    pub fn subscribe(
        &mut self,
        event_type: &str,
        arguments: Arguments,
    ) -> Result<BlockingSubscription<'_>, ClientError> {
        let subscription_id = Uuid::new_v4().to_string();
        let request = SubscribeRequest {
            subscription_id: subscription_id.clone(),
            event_type: event_type.to_owned(),
            arguments,
        };
        self.send(&request.to_packet())?;
        self.stream.set_read_timeout(None).map_err(WireError::Io)?;
        info!(event_type, subscription_id = %subscription_id, "subscribed");
        Ok(BlockingSubscription {
            client: self,
            subscription_id,
            schema: None,
            ended: false,
            cancelled: false,
        })
    }

    /// Best-effort disconnect notification, then drop the stream.
    pub fn close(mut self) {
        if self.connected {
            let _ = self.send(&Disconnect.to_packet());
            self.connected = false;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        info!("disconnected");
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        if !self.connected {
            return Err(WireError::Closed.into());
        }
        send_packet(&mut self.stream, packet).map_err(|e| {
            if e.is_connection_error() {
                self.connected = false;
            }
            ClientError::from(e)
        })
    }

    fn recv(&mut self) -> Result<Packet, ClientError> {
        if !self.connected {
            return Err(WireError::Closed.into());
        }
        recv_packet(&mut self.stream, self.config.max_payload_size).map_err(|e| {
            if e.is_connection_error() {
                self.connected = false;
            }
            ClientError::from(e)
        })
    }
}

/// Iterator over one subscription's data payloads.
pub struct BlockingSubscription<'a> {
    client: &'a mut BlockingClient,
    subscription_id: String,
    schema: Option<Schema>,
    ended: bool,
    cancelled: bool,
}

impl BlockingSubscription<'_> {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Coerce every data payload against a declared schema.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Cancel the subscription: best-effort unsubscribe, then the
    /// iterator is exhausted.
    pub fn cancel(&mut self) {
        if self.ended || self.cancelled {
            return;
        }
        self.cancelled = true;
        let request = UnsubscribeRequest {
            subscription_id: self.subscription_id.clone(),
        };
        let _ = self.client.send(&request.to_packet());
        debug!(subscription_id = %self.subscription_id, "unsubscribed");
    }
}

impl Iterator for BlockingSubscription<'_> {
    type Item = Result<Value, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ended || self.cancelled {
            return None;
        }
        let packet = match self.client.recv() {
            Ok(packet) => packet,
            Err(ClientError::Wire(WireError::Closed)) => {
                self.ended = true;
                return None;
            }
            Err(e) => {
                self.ended = true;
                return Some(Err(e));
            }
        };

        match packet.packet_type {
            PacketType::SubscribeData => match SubscribeData::from_packet(&packet) {
                Ok(data) if data.subscription_id == self.subscription_id => match &self.schema {
                    Some(schema) => {
                        Some(coerce::coerce(data.data, schema).map_err(ClientError::from))
                    }
                    None => Some(Ok(data.data)),
                },
                Ok(_) => {
                    self.ended = true;
                    Some(Err(ClientError::UnexpectedPacket(
                        packet.packet_type.as_byte(),
                    )))
                }
                Err(e) => {
                    self.ended = true;
                    Some(Err(e.into()))
                }
            },
            PacketType::SubscribeEnd => {
                self.ended = true;
                match SubscribeEnd::from_packet(&packet) {
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
            PacketType::SubscribeError => {
                self.ended = true;
                match SubscribeError::from_packet(&packet) {
                    Ok(error) => Some(Err(ClientError::Subscription {
                        error_code: error.error_code,
                        message: error.message,
                    })),
                    Err(e) => Some(Err(e.into())),
                }
            }
            other => {
                self.ended = true;
                Some(Err(ClientError::UnexpectedPacket(other.as_byte())))
            }
        }
    }
}

impl Drop for BlockingSubscription<'_> {
    /// Cancel-on-drop, then restore the configured read timeout.
    fn drop(&mut self) {
        if !self.ended && !self.cancelled {
            self.cancel();
        }
        let _ = self
            .client
            .stream
            .set_read_timeout(self.client.config.read_timeout);
    }
}

fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr, ClientError> {
    addr.to_socket_addrs()
        .map_err(WireError::Io)?
        .next()
        .ok_or_else(|| {
            ClientError::Wire(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            )))
        })
}
