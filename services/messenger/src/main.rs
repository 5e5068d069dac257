// messenger: binary entry point.
//
// Loads TOML config, seeds the in-memory directory, starts the HTCP
// server, and runs until SIGINT/SIGTERM.  Startup failures exit
// non-zero; a clean shutdown exits 0.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use messenger::config;
use messenger::directory::InMemoryDirectory;
use messenger::notify::NotifyHub;
use messenger::{build_server, repositories_from_directory};
use tracing::info;

#[derive(Parser)]
#[command(name = "messenger", about = "HTCP messaging server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/messenger/messenger.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "messenger starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    info!(
        server_name = %cfg.server_name,
        host = %cfg.server.host,
        port = cfg.server.port,
        "config loaded"
    );

    let directory = Arc::new(InMemoryDirectory::default());
    for (token, user_id) in &cfg.directory.tokens {
        directory.insert_token(token.clone(), *user_id);
    }
    for (chat_id, members) in &cfg.directory.chats {
        directory.add_chat(*chat_id, members.clone());
    }

    let repos = repositories_from_directory(directory);
    let hub = NotifyHub::new(repos.clone(), cfg.notify.queue_capacity);

    let server = match build_server(&cfg, hub, repos) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: failed to register handlers: {e}");
            std::process::exit(1);
        }
    };
    let handle = match server.start().await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("FATAL: failed to start server: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    handle.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
