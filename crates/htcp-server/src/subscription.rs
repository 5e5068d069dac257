//! Active subscription tracking.
//!
//! Every producer task is registered here under its client-minted id and
//! indexed by the owning connection's address, so that unsubscribe,
//! connection close, and server shutdown can each cancel exactly the
//! right set.  Cancellation aborts the producer task; the canceller
//! removes the registry entry in the same critical section, so the count
//! drops before the task is even polled again.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Error)]
#[error("subscription id '{0}' is already active")]
pub struct DuplicateSubscriptionId(pub String);

pub struct ActiveSubscription {
    pub subscription_id: String,
    pub event_type: String,
    pub owner: SocketAddr,
    abort: AbortHandle,
    cancelled: AtomicBool,
}

impl ActiveSubscription {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct State {
    by_id: HashMap<String, Arc<ActiveSubscription>>,
    by_owner: HashMap<SocketAddr, HashSet<String>>,
}

/// Registry of running producer tasks.
#[derive(Default)]
pub struct ActiveSubscriptionRegistry {
    inner: Mutex<State>,
}

impl ActiveSubscriptionRegistry {
    /// Register a producer task.  Ids are client-minted and must be
    /// unique among active subscriptions.
    pub fn add(
        &self,
        subscription_id: String,
        event_type: String,
        owner: SocketAddr,
        abort: AbortHandle,
    ) -> Result<Arc<ActiveSubscription>, DuplicateSubscriptionId> {
        let mut state = self.inner.lock().expect("subscription registry poisoned");
        if state.by_id.contains_key(&subscription_id) {
            return Err(DuplicateSubscriptionId(subscription_id));
        }
        let sub = Arc::new(ActiveSubscription {
            subscription_id: subscription_id.clone(),
            event_type,
            owner,
            abort,
            cancelled: AtomicBool::new(false),
        });
        state.by_id.insert(subscription_id.clone(), Arc::clone(&sub));
        state
            .by_owner
            .entry(owner)
            .or_default()
            .insert(subscription_id);
        Ok(sub)
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.inner
            .lock()
            .expect("subscription registry poisoned")
            .by_id
            .contains_key(subscription_id)
    }

    /// Remove an entry without cancelling; used by a producer task
    /// cleaning up after itself.
    pub fn remove(&self, subscription_id: &str) -> Option<Arc<ActiveSubscription>> {
        let mut state = self.inner.lock().expect("subscription registry poisoned");
        remove_locked(&mut state, subscription_id)
    }

    /// Cancel and remove all subscriptions owned by one connection.
    /// Returns how many were cancelled.
    pub fn cancel_for_client(&self, owner: SocketAddr) -> usize {
        let removed = {
            let mut state = self.inner.lock().expect("subscription registry poisoned");
            let ids = state.by_owner.remove(&owner).unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| state.by_id.remove(&id))
                .collect::<Vec<_>>()
        };
        for sub in &removed {
            sub.cancel();
            debug!(
                subscription_id = %sub.subscription_id,
                event_type = %sub.event_type,
                "cancelled subscription for closing connection"
            );
        }
        removed.len()
    }

    /// Cancel and remove every active subscription (server shutdown).
    pub fn cancel_all(&self) -> usize {
        let removed = {
            let mut state = self.inner.lock().expect("subscription registry poisoned");
            state.by_owner.clear();
            state.by_id.drain().map(|(_, sub)| sub).collect::<Vec<_>>()
        };
        for sub in &removed {
            sub.cancel();
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("subscription registry poisoned")
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_locked(state: &mut State, subscription_id: &str) -> Option<Arc<ActiveSubscription>> {
    let sub = state.by_id.remove(subscription_id)?;
    if let Some(ids) = state.by_owner.get_mut(&sub.owner) {
        ids.remove(subscription_id);
        if ids.is_empty() {
            state.by_owner.remove(&sub.owner);
        }
    }
    Some(sub)
}
