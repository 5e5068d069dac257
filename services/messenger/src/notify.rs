//! The notify hub: per-user mailbox fan-out for application events.
//!
//! Data model: `user_id → (token → bounded queue)`.  A user is *online*
//! exactly while they own at least one queue.  Subscribe, unsubscribe,
//! and every `notify_*` operation serialize behind one async mutex;
//! presence broadcasts run after the table mutation commits, outside the
//! guard, so they can fan out through `notify_user` without re-entry.
//!
//! Queues are bounded (`queue_capacity`).  The delivery policy is
//! block-producer: a full queue applies backpressure to the notifier
//! rather than dropping events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::Event;
use crate::repos::{RepoError, Repositories};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unknown token")]
    UnknownToken,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

type SubscriptionTable = HashMap<i64, HashMap<String, mpsc::Sender<Event>>>;

struct HubInner {
    queue_capacity: usize,
    table: tokio::sync::Mutex<SubscriptionTable>,
    repos: Repositories,
}

/// Cheaply cloneable handle to the process-wide hub.
#[derive(Clone)]
pub struct NotifyHub {
    inner: Arc<HubInner>,
}

impl NotifyHub {
    pub fn new(repos: Repositories, queue_capacity: usize) -> NotifyHub {
        NotifyHub {
            inner: Arc::new(HubInner {
                queue_capacity,
                table: tokio::sync::Mutex::new(HashMap::new()),
                repos,
            }),
        }
    }

    /// Resolve the token, install a mailbox, and return the event feed.
    ///
    /// The 0→1 queue transition broadcasts `user_online` to every user
    /// sharing a chat with the subject.  Dropping the returned
    /// subscription removes the mailbox; the 1→0 transition records
    /// `last_online_at` and broadcasts `user_offline`.
    pub async fn subscribe(&self, token: &str) -> Result<EventSubscription, NotifyError> {
        let record = self
            .inner
            .repos
            .tokens
            .lookup(token)
            .await?
            .ok_or(NotifyError::UnknownToken)?;
        let user_id = record.user_id;

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let came_online = {
            let mut table = self.inner.table.lock().await;
            let queues = table.entry(user_id).or_default();
            let first = queues.is_empty();
            queues.insert(token.to_owned(), tx);
            first
        };
        info!(user_id, came_online, "user subscribed");

        if came_online {
            broadcast_presence(&self.inner, user_id, true).await;
        }

        Ok(EventSubscription {
            rx,
            _guard: SubscriberGuard {
                inner: Arc::clone(&self.inner),
                user_id,
                token: token.to_owned(),
            },
        })
    }

    /// True while the user owns at least one active queue.
    pub async fn is_online(&self, user_id: i64) -> bool {
        self.inner
            .table
            .lock()
            .await
            .get(&user_id)
            .is_some_and(|queues| !queues.is_empty())
    }

    pub async fn online_user_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.table.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Enqueue on every queue of the user; a missing user is a silent
    /// no-op.  Runs under the hub guard so it is atomic with respect to
    /// subscribe/unsubscribe.
    pub async fn notify_user(&self, user_id: i64, event: Event) {
        let table = self.inner.table.lock().await;
        let Some(queues) = table.get(&user_id) else {
            return;
        };
        for queue in queues.values() {
            // Block-producer policy: wait out a full queue.  A receiver
            // dropped mid-send just loses this copy.
            let _ = queue.send(event.clone()).await;
        }
    }

    pub async fn notify_users(&self, user_ids: &[i64], event: Event) {
        for &user_id in user_ids {
            self.notify_user(user_id, event.clone()).await;
        }
    }

    /// Expand the chat membership once, then notify each member.
    pub async fn notify_chat(
        &self,
        chat_id: i64,
        event: Event,
        exclude_user: Option<i64>,
    ) -> Result<(), NotifyError> {
        let members = self.inner.repos.chats.members_of(chat_id).await?;
        for member in members {
            if exclude_user == Some(member) {
                continue;
            }
            self.notify_user(member, event.clone()).await;
        }
        Ok(())
    }

    // Event senders used by the transaction handlers.

    pub async fn send_new_message(
        &self,
        chat_id: i64,
        sender_user_id: i64,
        sender_username: &str,
        chat_name: &str,
        message_id: i64,
        message_preview: &str,
    ) -> Result<(), NotifyError> {
        let preview: String = message_preview.chars().take(61).collect();
        let event = Event::new(
            "new_message",
            htcp_protocol::arguments! {
                "sender_username" => sender_username,
                "chat_name" => chat_name,
                "sender_user_id" => sender_user_id,
                "chat_id" => chat_id,
                "message_id" => message_id,
                "message_content" => preview,
            },
        );
        self.notify_chat(chat_id, event, Some(sender_user_id)).await
    }

    pub async fn send_message_edited(
        &self,
        chat_id: i64,
        message_id: i64,
        editor_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "message_edited",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "message_id" => message_id,
                "editor_user_id" => editor_user_id,
            },
        );
        self.notify_chat(chat_id, event, None).await
    }

    pub async fn send_message_deleted(
        &self,
        chat_id: i64,
        message_id: i64,
        deleter_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "message_deleted",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "message_id" => message_id,
                "deleter_user_id" => deleter_user_id,
            },
        );
        self.notify_chat(chat_id, event, None).await
    }

    pub async fn send_chat_created(
        &self,
        chat_id: i64,
        chat_name: &str,
        creator_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "chat_created",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "chat_name" => chat_name,
                "creator_user_id" => creator_user_id,
            },
        );
        self.notify_chat(chat_id, event, None).await
    }

    pub async fn send_member_added(
        &self,
        chat_id: i64,
        added_user_id: i64,
        adder_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "member_added",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "added_user_id" => added_user_id,
                "adder_user_id" => adder_user_id,
            },
        );
        self.notify_chat(chat_id, event, None).await
    }

    /// Chat members hear about the removal; so does the removed user,
    /// who is no longer a member.
    pub async fn send_member_removed(
        &self,
        chat_id: i64,
        removed_user_id: i64,
        remover_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "member_removed",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "removed_user_id" => removed_user_id,
                "remover_user_id" => remover_user_id,
            },
        );
        self.notify_chat(chat_id, event.clone(), None).await?;
        self.notify_user(removed_user_id, event).await;
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: i64, user_id: i64) -> Result<(), NotifyError> {
        let event = Event::new(
            "typing",
            htcp_protocol::arguments! {"chat_id" => chat_id, "user_id" => user_id},
        );
        self.notify_chat(chat_id, event, Some(user_id)).await
    }

    pub async fn send_read_status(
        &self,
        chat_id: i64,
        message_id: i64,
        reader_user_id: i64,
    ) -> Result<(), NotifyError> {
        let event = Event::new(
            "read_status",
            htcp_protocol::arguments! {
                "chat_id" => chat_id,
                "message_id" => message_id,
                "reader_user_id" => reader_user_id,
            },
        );
        self.notify_chat(chat_id, event, None).await
    }
}

/// One subscriber's event feed.  Dropping it unsubscribes the token.
pub struct EventSubscription {
    rx: mpsc::Receiver<Event>,
    _guard: SubscriberGuard,
}

impl EventSubscription {
    /// Wait for the next event; `None` only after the hub is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription").finish_non_exhaustive()
    }
}

struct SubscriberGuard {
    inner: Arc<HubInner>,
    user_id: i64,
    token: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        let user_id = self.user_id;
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                unsubscribe(inner, user_id, &token).await;
            });
        }
    }
}

async fn unsubscribe(inner: Arc<HubInner>, user_id: i64, token: &str) {
    let went_offline = {
        let mut table = inner.table.lock().await;
        match table.get_mut(&user_id) {
            Some(queues) => {
                queues.remove(token);
                if queues.is_empty() {
                    table.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    };
    debug!(user_id, went_offline, "user unsubscribed");

    if went_offline {
        if let Err(e) = inner.repos.accounts.update_last_online(user_id).await {
            warn!(user_id, error = %e, "failed to record last_online_at");
        }
        broadcast_presence(&inner, user_id, false).await;
    }
}

/// Tell everyone who shares a chat with the subject (deduplicated,
/// subject excluded) that they came online or went offline.
async fn broadcast_presence(inner: &Arc<HubInner>, user_id: i64, online: bool) {
    let chats = match inner.repos.chats.chats_of(user_id).await {
        Ok(chats) => chats,
        Err(e) => {
            warn!(user_id, error = %e, "presence broadcast: chats lookup failed");
            return;
        }
    };

    let kind = if online { "user_online" } else { "user_offline" };
    let event = Event::new(kind, htcp_protocol::arguments! {"user_id" => user_id});

    let mut notified: HashSet<i64> = HashSet::new();
    for chat_id in chats {
        let members = match inner.repos.chats.members_of(chat_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(chat_id, error = %e, "presence broadcast: members lookup failed");
                continue;
            }
        };
        for member in members {
            if member != user_id && notified.insert(member) {
                notify_one(inner, member, event.clone()).await;
            }
        }
    }
}

async fn notify_one(inner: &Arc<HubInner>, user_id: i64, event: Event) {
    let table = inner.table.lock().await;
    if let Some(queues) = table.get(&user_id) {
        for queue in queues.values() {
            let _ = queue.send(event.clone()).await;
        }
    }
}
