//! Collaborator repository interfaces consumed by the notify hub.
//!
//! These are pure interfaces: the hub borrows them and never learns the
//! storage technology behind them.  The in-memory implementations live
//! in [`crate::directory`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository failure: {0}")]
    Backend(String),
}

/// Resolved token row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRecord {
    pub user_id: i64,
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn lookup(&self, token: &str) -> Result<Option<TokenRecord>, RepoError>;
}

#[async_trait]
pub trait AccountsRepository: Send + Sync {
    async fn update_last_online(&self, user_id: i64) -> Result<(), RepoError>;
}

#[async_trait]
pub trait ChatMembershipRepository: Send + Sync {
    async fn members_of(&self, chat_id: i64) -> Result<Vec<i64>, RepoError>;
    async fn chats_of(&self, user_id: i64) -> Result<Vec<i64>, RepoError>;
}

/// The bundle the hub is constructed with (constructor injection; no
/// cycles — repositories never know about the hub).
#[derive(Clone)]
pub struct Repositories {
    pub tokens: Arc<dyn TokenRepository>,
    pub accounts: Arc<dyn AccountsRepository>,
    pub chats: Arc<dyn ChatMembershipRepository>,
}
