//! In-memory directory implementing the repository interfaces.
//!
//! Used by the binary for config-seeded local deployments and by the
//! test suites.  Production deployments substitute their own
//! implementations of the traits in [`crate::repos`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::repos::{
    AccountsRepository, ChatMembershipRepository, RepoError, TokenRecord, TokenRepository,
};

#[derive(Default)]
struct DirectoryState {
    tokens: HashMap<String, i64>,
    last_online: HashMap<i64, DateTime<Utc>>,
    chat_members: HashMap<i64, Vec<i64>>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn insert_token(&self, token: impl Into<String>, user_id: i64) {
        self.lock().tokens.insert(token.into(), user_id);
    }

    pub fn add_chat(&self, chat_id: i64, members: Vec<i64>) {
        self.lock().chat_members.insert(chat_id, members);
    }

    pub fn last_online(&self, user_id: i64) -> Option<DateTime<Utc>> {
        self.lock().last_online.get(&user_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().expect("directory lock poisoned")
    }
}

#[async_trait]
impl TokenRepository for InMemoryDirectory {
    async fn lookup(&self, token: &str) -> Result<Option<TokenRecord>, RepoError> {
        Ok(self
            .lock()
            .tokens
            .get(token)
            .map(|&user_id| TokenRecord { user_id }))
    }
}

#[async_trait]
impl AccountsRepository for InMemoryDirectory {
    async fn update_last_online(&self, user_id: i64) -> Result<(), RepoError> {
        self.lock().last_online.insert(user_id, Utc::now());
        Ok(())
    }
}

#[async_trait]
impl ChatMembershipRepository for InMemoryDirectory {
    async fn members_of(&self, chat_id: i64) -> Result<Vec<i64>, RepoError> {
        Ok(self
            .lock()
            .chat_members
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn chats_of(&self, user_id: i64) -> Result<Vec<i64>, RepoError> {
        let state = self.lock();
        let mut chats: Vec<i64> = state
            .chat_members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(&chat_id, _)| chat_id)
            .collect();
        chats.sort_unstable();
        Ok(chats)
    }
}
