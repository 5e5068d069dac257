//! Messenger configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/messenger/messenger.toml`.  Every field has a default; the
//! `[directory]` section optionally seeds the in-memory directory for
//! local deployments.
//!
//! ```toml
//! server_name = "messenger"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 2353
//! max_connections = 100       # 0 = unbounded
//! expose_transactions = true
//! listen_backlog = 128
//! read_timeout_secs = 60      # 0 disables
//! write_timeout_secs = 60     # 0 disables
//! max_payload_size = 16777216
//!
//! [notify]
//! queue_capacity = 64
//!
//! [directory]
//! tokens = { "alice-token" = 1, "bob-token" = 2 }
//! chats = { "1" = [1, 2] }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use htcp_protocol::wire::MAX_PAYLOAD_SIZE;
use serde::Deserialize;
use thiserror::Error;

use crate::notify::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub server_name: String,
    pub server: ServerSection,
    pub notify: NotifySection,
    pub directory: DirectorySection,
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub expose_transactions: bool,
    pub listen_backlog: u32,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_payload_size: usize,
}

#[derive(Debug, Clone)]
pub struct NotifySection {
    pub queue_capacity: usize,
}

/// Seed data for the in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct DirectorySection {
    /// token → user id.
    pub tokens: HashMap<String, i64>,
    /// chat id → member user ids.
    pub chats: HashMap<i64, Vec<i64>>,
}

impl MessengerConfig {
    pub fn server_config(&self) -> htcp_server::ServerConfig {
        htcp_server::ServerConfig {
            name: self.server_name.clone(),
            host: self.server.host.clone(),
            port: self.server.port,
            max_connections: self.server.max_connections,
            expose_transactions: self.server.expose_transactions,
            listen_backlog: self.server.listen_backlog,
            read_timeout: self.server.read_timeout,
            write_timeout: self.server.write_timeout,
            max_payload_size: self.server.max_payload_size,
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> MessengerConfig {
        MessengerConfig {
            server_name: "messenger".to_owned(),
            server: ServerSection {
                host: "0.0.0.0".to_owned(),
                port: 2353,
                max_connections: 100,
                expose_transactions: true,
                listen_backlog: 128,
                read_timeout: Some(Duration::from_secs(60)),
                write_timeout: Some(Duration::from_secs(60)),
                max_payload_size: MAX_PAYLOAD_SIZE,
            },
            notify: NotifySection {
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            directory: DirectorySection::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every optional field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server_name: Option<String>,
    server: Option<RawServerSection>,
    notify: Option<RawNotifySection>,
    directory: Option<RawDirectorySection>,
}

#[derive(Debug, Deserialize)]
struct RawServerSection {
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
    expose_transactions: Option<bool>,
    listen_backlog: Option<u32>,
    read_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    max_payload_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawNotifySection {
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDirectorySection {
    tokens: Option<HashMap<String, i64>>,
    chats: Option<HashMap<String, Vec<i64>>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/messenger/messenger.toml`.
pub fn load_config() -> Result<MessengerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/messenger/messenger.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<MessengerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<MessengerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = MessengerConfig::default();

    let server = match raw.server {
        Some(raw_server) => ServerSection {
            host: raw_server.host.unwrap_or(defaults.server.host),
            port: raw_server.port.unwrap_or(defaults.server.port),
            max_connections: raw_server
                .max_connections
                .unwrap_or(defaults.server.max_connections),
            expose_transactions: raw_server
                .expose_transactions
                .unwrap_or(defaults.server.expose_transactions),
            listen_backlog: raw_server
                .listen_backlog
                .unwrap_or(defaults.server.listen_backlog),
            read_timeout: timeout_from_secs(raw_server.read_timeout_secs, defaults.server.read_timeout),
            write_timeout: timeout_from_secs(
                raw_server.write_timeout_secs,
                defaults.server.write_timeout,
            ),
            max_payload_size: raw_server
                .max_payload_size
                .unwrap_or(defaults.server.max_payload_size),
        },
        None => defaults.server,
    };
    if server.max_payload_size == 0 {
        return Err(ConfigError::InvalidValue(
            "server.max_payload_size must be positive".to_owned(),
        ));
    }

    let notify = match raw.notify {
        Some(raw_notify) => NotifySection {
            queue_capacity: raw_notify
                .queue_capacity
                .unwrap_or(defaults.notify.queue_capacity),
        },
        None => defaults.notify,
    };
    if notify.queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "notify.queue_capacity must be positive".to_owned(),
        ));
    }

    let directory = match raw.directory {
        Some(raw_directory) => {
            let mut chats = HashMap::new();
            for (key, members) in raw_directory.chats.unwrap_or_default() {
                let chat_id: i64 = key.parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("directory.chats key '{key}' is not an id"))
                })?;
                chats.insert(chat_id, members);
            }
            DirectorySection {
                tokens: raw_directory.tokens.unwrap_or_default(),
                chats,
            }
        }
        None => DirectorySection::default(),
    };

    Ok(MessengerConfig {
        server_name: raw.server_name.unwrap_or(defaults.server_name),
        server,
        notify,
        directory,
    })
}

/// `0` disables the timeout; absent means the default.
fn timeout_from_secs(secs: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match secs {
        None => default,
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    }
}
