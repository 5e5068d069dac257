//! Handler and connection registries.
//!
//! All registries expose only compound atomic operations; callers never
//! observe a partial mutation.  The handler registries are populated
//! before `start` and read-only afterwards; the connection registry is
//! mutated concurrently by the accept loop and the per-connection
//! workers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::connection::ConnectionHandle;
use crate::handler::{Subscription, Transaction};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("transaction '{0}' is already registered")]
    DuplicateTransaction(String),
    #[error("subscription '{0}' is already registered")]
    DuplicateSubscription(String),
}

/// Transactions keyed by code.
#[derive(Default)]
pub struct TransactionRegistry {
    inner: RwLock<HashMap<String, Arc<Transaction>>>,
}

impl TransactionRegistry {
    pub fn register(&self, transaction: Transaction) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("transaction registry poisoned");
        if map.contains_key(&transaction.code) {
            return Err(RegistryError::DuplicateTransaction(transaction.code));
        }
        map.insert(transaction.code.clone(), Arc::new(transaction));
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<Arc<Transaction>> {
        self.inner
            .read()
            .expect("transaction registry poisoned")
            .get(code)
            .cloned()
    }

    /// Registered codes in registration-independent (sorted) order, as
    /// advertised in the handshake response.
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .inner
            .read()
            .expect("transaction registry poisoned")
            .keys()
            .cloned()
            .collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("transaction registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Subscription producers keyed by event type.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn register(&self, subscription: Subscription) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("subscription registry poisoned");
        if map.contains_key(&subscription.event_type) {
            return Err(RegistryError::DuplicateSubscription(subscription.event_type));
        }
        map.insert(subscription.event_type.clone(), Arc::new(subscription));
        Ok(())
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<Subscription>> {
        self.inner
            .read()
            .expect("subscription registry poisoned")
            .get(event_type)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("subscription registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live connections keyed by peer address, with bounded admission.
///
/// `try_add` is the single test-and-insert critical section that makes
/// admission atomic under concurrent accepts.
pub struct ConnectionRegistry {
    max_connections: usize,
    inner: tokio::sync::Mutex<HashMap<SocketAddr, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// `max_connections == 0` means unbounded.
    pub fn new(max_connections: usize) -> ConnectionRegistry {
        ConnectionRegistry {
            max_connections,
            inner: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Admit a connection unless the bound is reached.  Returns false —
    /// without inserting — when the registry is full.
    pub async fn try_add(&self, conn: Arc<ConnectionHandle>) -> bool {
        let mut map = self.inner.lock().await;
        if self.max_connections > 0 && map.len() >= self.max_connections {
            return false;
        }
        map.insert(conn.addr(), conn);
        true
    }

    pub async fn remove(&self, addr: SocketAddr) -> Option<Arc<ConnectionHandle>> {
        self.inner.lock().await.remove(&addr)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Mark every connection disconnected and drop the registry's
    /// handles; each socket closes once its worker lets go.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<ConnectionHandle>> =
            self.inner.lock().await.drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htcp_protocol::Schema;

    #[test]
    fn duplicate_transaction_is_rejected() {
        let registry = TransactionRegistry::default();
        let make = || {
            Transaction::new_blocking("echo", vec![], Schema::Any, |_| {
                Ok(htcp_protocol::Value::Null)
            })
        };
        registry.register(make()).unwrap();
        assert!(matches!(
            registry.register(make()),
            Err(RegistryError::DuplicateTransaction(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn codes_are_sorted() {
        let registry = TransactionRegistry::default();
        for code in ["zeta", "alpha", "mid"] {
            registry
                .register(Transaction::new_blocking(code, vec![], Schema::Any, |_| {
                    Ok(htcp_protocol::Value::Null)
                }))
                .unwrap();
        }
        assert_eq!(registry.codes(), ["alpha", "mid", "zeta"]);
    }
}
