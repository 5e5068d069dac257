// messenger: HTCP-fronted messaging service.
//
// Wires the notify hub, the collaborator repositories, and the HTCP
// server surface together.  The binary in main.rs adds config loading
// and signal handling on top.

pub mod config;
pub mod directory;
pub mod events;
pub mod handlers;
pub mod notify;
pub mod repos;

use std::sync::Arc;

use directory::InMemoryDirectory;
use notify::NotifyHub;
use repos::{
    AccountsRepository, ChatMembershipRepository, Repositories, TokenRepository,
};

/// Bundle a single directory instance into the repositories the hub
/// consumes.
pub fn repositories_from_directory(directory: Arc<InMemoryDirectory>) -> Repositories {
    Repositories {
        tokens: Arc::clone(&directory) as Arc<dyn TokenRepository>,
        accounts: Arc::clone(&directory) as Arc<dyn AccountsRepository>,
        chats: directory as Arc<dyn ChatMembershipRepository>,
    }
}

/// Build the HTCP server with the full messenger surface registered.
pub fn build_server(
    config: &config::MessengerConfig,
    hub: NotifyHub,
    repos: Repositories,
) -> Result<htcp_server::Server, htcp_server::RegistryError> {
    let server = htcp_server::Server::new(config.server_config());
    handlers::register_all(&server, hub, repos)?;
    Ok(server)
}
