// htcp-server: server runtime for the HTCP protocol.
//
// Build a `Server` from a `ServerConfig`, register transactions and
// subscriptions, then `start()`.  The returned `ServerHandle` owns the
// lifecycle: accept loop, per-connection workers, producer tasks, and
// the graceful-shutdown cascade.

pub mod connection;
pub mod handler;
pub mod registry;
pub mod server;
pub mod subscription;

pub use handler::{
    EventStream, HandlerError, HandlerResult, Subscription, SubscriptionProducer, Transaction,
    TransactionHandler,
};
pub use registry::{ConnectionRegistry, RegistryError, SubscriptionRegistry, TransactionRegistry};
pub use server::{Server, ServerConfig, ServerError, ServerHandle};
pub use subscription::{ActiveSubscription, ActiveSubscriptionRegistry};
