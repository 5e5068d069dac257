//! Accept loop, per-connection state machine, and dispatch.
//!
//! One task accepts; one task reads per connection; one task runs per
//! active subscription.  All of them watch the same shutdown channel, so
//! a stop request unwinds the whole tree: producers are cancelled,
//! connections closed (waking blocked readers), then the accept task
//! drains its workers before the handle's `shutdown` returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use htcp_protocol::aio;
use htcp_protocol::coerce;
use htcp_protocol::message::{
    ErrorMessage, HandshakeResponse, SubscribeData, SubscribeEnd, SubscribeError,
    SubscribeRequest, TransactionCall, TransactionResult, UnsubscribeRequest,
};
use htcp_protocol::wire::{
    DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_CONNECTIONS, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
    MAX_PAYLOAD_SIZE,
};
use htcp_protocol::{ErrorCode, Packet, PacketType, WireError};
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandle;
use crate::handler::{EventStream, Subscription, Transaction};
use crate::registry::{
    ConnectionRegistry, RegistryError, SubscriptionRegistry, TransactionRegistry,
};
use crate::subscription::ActiveSubscriptionRegistry;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot resolve listen address '{0}'")]
    InvalidAddress(String),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side knobs; every field has the protocol's documented default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Display name returned in the handshake response.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// 0 = unbounded.
    pub max_connections: usize,
    /// When false the handshake advertises an empty transaction list.
    pub expose_transactions: bool,
    pub listen_backlog: u32,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            name: "htcp-server".to_owned(),
            host: "0.0.0.0".to_owned(),
            port: 2353,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            expose_transactions: true,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

/// An HTCP server under construction: register handlers, then `start`.
pub struct Server {
    config: ServerConfig,
    transactions: TransactionRegistry,
    subscriptions: SubscriptionRegistry,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config,
            transactions: TransactionRegistry::default(),
            subscriptions: SubscriptionRegistry::default(),
        }
    }

    pub fn register_transaction(&self, transaction: Transaction) -> Result<(), RegistryError> {
        debug!(code = %transaction.code, "registered transaction");
        self.transactions.register(transaction)
    }

    pub fn register_subscription(&self, subscription: Subscription) -> Result<(), RegistryError> {
        debug!(event_type = %subscription.event_type, "registered subscription");
        self.subscriptions.register(subscription)
    }

    /// Bind and begin accepting.  Returns once the listener is live.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connections: ConnectionRegistry::new(self.config.max_connections),
            active: ActiveSubscriptionRegistry::default(),
            transactions: self.transactions,
            subscriptions: self.subscriptions,
            config: self.config,
        });

        info!(
            name = %shared.config.name,
            %local_addr,
            transactions = shared.transactions.len(),
            subscriptions = shared.subscriptions.len(),
            "server listening"
        );

        let accept_task = tokio::spawn(accept_loop(Arc::clone(&shared), listener, shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            shared,
            accept_task,
        })
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(self.config.host.clone()))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|source| ServerError::Bind { addr, source })?;
        socket
            .listen(self.config.listen_backlog)
            .map_err(|source| ServerError::Bind { addr, source })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shared: Arc<Shared>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently running producer tasks.
    pub fn active_subscriptions(&self) -> usize {
        self.shared.active.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.connections.len().await
    }

    /// Graceful shutdown: cancel every producer, close every connection,
    /// then wait for all workers and the accept loop to exit.
    pub async fn shutdown(self) {
        info!("server shutting down");
        let _ = self.shutdown_tx.send(true);
        let cancelled = self.shared.active.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled active subscriptions");
        }
        self.shared.connections.close_all().await;
        let _ = self.accept_task.await;
        info!("server stopped");
    }
}

struct Shared {
    config: ServerConfig,
    transactions: TransactionRegistry,
    subscriptions: SubscriptionRegistry,
    connections: ConnectionRegistry,
    active: ActiveSubscriptionRegistry,
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    // Reap finished connection workers as we go.
                    while workers.try_join_next().is_some() {}
                    admit(&shared, &mut workers, stream, addr, shutdown.clone()).await;
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
    drop(listener);
    while workers.join_next().await.is_some() {}
    debug!("accept loop stopped");
}

async fn admit(
    shared: &Arc<Shared>,
    workers: &mut JoinSet<()>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let conn = ConnectionHandle::new(
        addr,
        write_half,
        shared.config.read_timeout,
        shared.config.write_timeout,
    );
    // Atomic test-and-insert: over capacity means close immediately,
    // without sending any packet.
    if !shared.connections.try_add(Arc::clone(&conn)).await {
        warn!(
            %addr,
            max_connections = shared.config.max_connections,
            "connection rejected: at capacity"
        );
        conn.close();
        return;
    }
    info!(%addr, "client connected");
    workers.spawn(serve_connection(Arc::clone(shared), conn, read_half, shutdown));
}

/// Per-connection session states.
enum SessionState {
    /// Only a handshake request is legal.
    Greeting,
    /// Handshake done; calls and subscriptions flow.
    Established,
}

enum Flow {
    Continue,
    Close,
}

async fn serve_connection(
    shared: Arc<Shared>,
    conn: Arc<ConnectionHandle>,
    mut read_half: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = conn.addr();
    let mut state = SessionState::Greeting;

    while conn.is_connected() {
        let received = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = aio::recv_packet(
                &mut read_half,
                shared.config.max_payload_size,
                conn.read_timeout(),
            ) => received,
        };

        match received {
            Ok(packet) => match process_packet(&shared, &conn, &mut state, packet).await {
                Flow::Continue => {}
                Flow::Close => break,
            },
            Err(WireError::Closed) => {
                debug!(%addr, "client closed the stream");
                break;
            }
            Err(e) if e.is_connection_error() => {
                warn!(%addr, error = %e, "connection error");
                break;
            }
            Err(e @ WireError::PayloadTooLarge { .. }) => {
                // Oversize frames close immediately, before any payload
                // byte is read and without a reply.
                warn!(%addr, error = %e, "oversize payload");
                break;
            }
            Err(e) => {
                // Framing violation: report it if we still can, then close.
                warn!(%addr, error = %e, "protocol error");
                let msg = ErrorMessage::new(ErrorCode::ProtocolError, e.to_string());
                let _ = conn.send(msg.to_packet()).await;
                break;
            }
        }
    }

    let cancelled = shared.active.cancel_for_client(addr);
    if cancelled > 0 {
        debug!(%addr, cancelled, "cancelled subscriptions for closed connection");
    }
    shared.connections.remove(addr).await;
    conn.close();
    info!(%addr, "client disconnected");
}

async fn process_packet(
    shared: &Arc<Shared>,
    conn: &Arc<ConnectionHandle>,
    state: &mut SessionState,
    packet: Packet,
) -> Flow {
    match (&*state, packet.packet_type) {
        (SessionState::Greeting, PacketType::HandshakeRequest) => {
            let transactions = if shared.config.expose_transactions {
                shared.transactions.codes()
            } else {
                Vec::new()
            };
            let response = HandshakeResponse {
                server_name: shared.config.name.clone(),
                transactions,
            };
            if conn.send(response.to_packet()).await.is_err() {
                return Flow::Close;
            }
            *state = SessionState::Established;
            Flow::Continue
        }
        (SessionState::Greeting, other) => {
            let msg = ErrorMessage::new(
                ErrorCode::ProtocolError,
                format!("handshake required before packet type 0x{:02x}", other.as_byte()),
            );
            let _ = conn.send(msg.to_packet()).await;
            Flow::Close
        }
        (SessionState::Established, PacketType::HandshakeRequest) => {
            // Repeated handshake: complain, keep the session.
            let msg = ErrorMessage::new(ErrorCode::ProtocolError, "handshake already completed");
            let _ = conn.send(msg.to_packet()).await;
            Flow::Continue
        }
        (SessionState::Established, PacketType::TransactionCall) => {
            handle_transaction(shared, conn, &packet).await
        }
        (SessionState::Established, PacketType::SubscribeRequest) => {
            handle_subscribe(shared, conn, &packet).await
        }
        (SessionState::Established, PacketType::UnsubscribeRequest) => {
            handle_unsubscribe(shared, &packet).await
        }
        (SessionState::Established, PacketType::Disconnect) => Flow::Close,
        (SessionState::Established, other) => {
            let msg = ErrorMessage::new(
                ErrorCode::ProtocolError,
                format!("unexpected packet type 0x{:02x}", other.as_byte()),
            );
            let _ = conn.send(msg.to_packet()).await;
            Flow::Close
        }
    }
}

async fn handle_transaction(
    shared: &Arc<Shared>,
    conn: &Arc<ConnectionHandle>,
    packet: &Packet,
) -> Flow {
    let call = match TransactionCall::from_packet(packet) {
        Ok(call) => call,
        Err(e) => {
            let msg = ErrorMessage::new(ErrorCode::ProtocolError, e.to_string());
            let _ = conn.send(msg.to_packet()).await;
            return Flow::Close;
        }
    };
    debug!(addr = %conn.addr(), transaction = %call.transaction, "transaction call");

    let Some(transaction) = shared.transactions.get(&call.transaction) else {
        let reply = TransactionResult::failure(
            ErrorCode::UnknownTransaction,
            format!("Unknown transaction: {}", call.transaction),
        );
        let _ = conn.send(reply.to_packet()).await;
        return Flow::Continue;
    };

    let args = match coerce::prepare_arguments(&transaction.params, call.arguments) {
        Ok(args) => args,
        Err(e) => {
            let reply = TransactionResult::failure(ErrorCode::InvalidArguments, e.to_string());
            let _ = conn.send(reply.to_packet()).await;
            return Flow::Continue;
        }
    };

    let reply = match transaction.handler.invoke(args).await {
        Ok(result) => TransactionResult::ok(result),
        Err(e) => {
            error!(transaction = %call.transaction, error = %e, "handler failed");
            TransactionResult::failure(ErrorCode::ExecutionError, e.to_string())
        }
    };
    let _ = conn.send(reply.to_packet()).await;
    Flow::Continue
}

async fn handle_subscribe(
    shared: &Arc<Shared>,
    conn: &Arc<ConnectionHandle>,
    packet: &Packet,
) -> Flow {
    let request = match SubscribeRequest::from_packet(packet) {
        Ok(request) => request,
        Err(e) => {
            let msg = ErrorMessage::new(ErrorCode::ProtocolError, e.to_string());
            let _ = conn.send(msg.to_packet()).await;
            return Flow::Close;
        }
    };
    info!(
        addr = %conn.addr(),
        event_type = %request.event_type,
        subscription_id = %request.subscription_id,
        "subscribe request"
    );

    let Some(subscription) = shared.subscriptions.get(&request.event_type) else {
        let msg = SubscribeError {
            subscription_id: request.subscription_id,
            error_code: ErrorCode::UnknownTransaction,
            message: format!("Unknown subscription event type: {}", request.event_type),
        };
        let _ = conn.send(msg.to_packet()).await;
        return Flow::Continue;
    };

    let args = match coerce::prepare_arguments(&subscription.params, request.arguments) {
        Ok(args) => args,
        Err(e) => {
            let msg = SubscribeError {
                subscription_id: request.subscription_id,
                error_code: ErrorCode::InvalidArguments,
                message: e.to_string(),
            };
            let _ = conn.send(msg.to_packet()).await;
            return Flow::Continue;
        }
    };

    let stream = subscription.producer.open(args);

    // The producer waits on the gate until its registry entry exists, so
    // a stream that finishes instantly cannot race its own cleanup.
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let producer_shared = Arc::clone(shared);
    let producer_conn = Arc::clone(conn);
    let id = request.subscription_id.clone();
    let join = tokio::spawn(async move {
        if ready_rx.await.is_err() {
            return;
        }
        run_producer(producer_shared, producer_conn, id, stream).await;
    });

    match shared.active.add(
        request.subscription_id.clone(),
        request.event_type.clone(),
        conn.addr(),
        join.abort_handle(),
    ) {
        Ok(_) => {
            let _ = ready_tx.send(());
            // A subscribed client is not required to send anything.
            conn.disable_read_timeout();
        }
        Err(e) => {
            join.abort();
            let msg = SubscribeError {
                subscription_id: request.subscription_id,
                error_code: ErrorCode::InvalidArguments,
                message: e.to_string(),
            };
            let _ = conn.send(msg.to_packet()).await;
        }
    }
    Flow::Continue
}

async fn run_producer(
    shared: Arc<Shared>,
    conn: Arc<ConnectionHandle>,
    subscription_id: String,
    mut stream: EventStream,
) {
    loop {
        match stream.next().await {
            Some(Ok(data)) => {
                if !conn.is_connected() {
                    break;
                }
                let packet = SubscribeData {
                    subscription_id: subscription_id.clone(),
                    data,
                }
                .to_packet();
                // A broken connection ends the stream silently.
                if conn.send(packet).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(subscription_id = %subscription_id, error = %e, "producer failed");
                if conn.is_connected() {
                    let msg = SubscribeError {
                        subscription_id: subscription_id.clone(),
                        error_code: ErrorCode::ExecutionError,
                        message: e.to_string(),
                    };
                    let _ = conn.send(msg.to_packet()).await;
                }
                break;
            }
            None => {
                if conn.is_connected() {
                    let end = SubscribeEnd {
                        subscription_id: subscription_id.clone(),
                    };
                    let _ = conn.send(end.to_packet()).await;
                }
                break;
            }
        }
    }
    shared.active.remove(&subscription_id);
    debug!(subscription_id = %subscription_id, "subscription ended");
}

async fn handle_unsubscribe(shared: &Arc<Shared>, packet: &Packet) -> Flow {
    let Ok(request) = UnsubscribeRequest::from_packet(packet) else {
        // Malformed unsubscribe is harmless; ignore it like an unknown id.
        return Flow::Continue;
    };
    // Unknown ids are tolerated: the client may race cancel with end.
    if let Some(sub) = shared.active.remove(&request.subscription_id) {
        sub.cancel();
        debug!(subscription_id = %request.subscription_id, "unsubscribed");
    }
    Flow::Continue
}
