//! The messenger's HTCP surface: explicit transaction and subscription
//! registrations wired to the notify hub.
//!
//! Handlers stay thin — they resolve the caller's token, then delegate
//! to the hub's event senders.  The relational side of the application
//! (users, chats, message storage) lives behind the repository traits.

use chrono::Utc;
use htcp_protocol::{Param, RecordSchema, Schema, Value};
use htcp_server::{HandlerError, RegistryError, Server, Subscription, Transaction};
use tracing::warn;

use crate::events::EVENT_TYPE_NAME;
use crate::notify::NotifyHub;
use crate::repos::Repositories;

/// Register the full application surface on a server.
pub fn register_all(
    server: &Server,
    hub: NotifyHub,
    repos: Repositories,
) -> Result<(), RegistryError> {
    server.register_transaction(ping())?;
    server.register_transaction(server_time())?;
    server.register_transaction(is_online(hub.clone()))?;
    server.register_transaction(online_users(hub.clone()))?;
    server.register_transaction(send_chat_message(hub.clone(), repos.clone()))?;
    server.register_transaction(send_typing(hub.clone(), repos.clone()))?;
    server.register_transaction(mark_read(hub.clone(), repos))?;
    server.register_subscription(updates(hub))?;
    Ok(())
}

fn ping() -> Transaction {
    Transaction::new_blocking("ping", vec![], Schema::Str, |_args| Ok(Value::from("pong")))
}

fn server_time() -> Transaction {
    Transaction::new_async("server_time", vec![], Schema::DateTime, |_args| async {
        Ok(Value::DateTime(Utc::now().fixed_offset()))
    })
}

fn is_online(hub: NotifyHub) -> Transaction {
    Transaction::new_async(
        "is_online",
        vec![Param::new("user_id", Schema::Int)],
        Schema::Bool,
        move |args| {
            let hub = hub.clone();
            async move {
                let user_id = require_i64(&args, "user_id")?;
                Ok(Value::Bool(hub.is_online(user_id).await))
            }
        },
    )
}

fn online_users(hub: NotifyHub) -> Transaction {
    Transaction::new_async(
        "online_users",
        vec![],
        Schema::list(Schema::Int),
        move |_args| {
            let hub = hub.clone();
            async move {
                let ids = hub.online_user_ids().await;
                Ok(Value::List(ids.into_iter().map(Value::from).collect()))
            }
        },
    )
}

fn send_chat_message(hub: NotifyHub, repos: Repositories) -> Transaction {
    Transaction::new_async(
        "send_chat_message",
        vec![
            Param::new("token", Schema::Str),
            Param::new("chat_id", Schema::Int),
            Param::new("chat_name", Schema::Str),
            Param::new("sender_username", Schema::Str),
            Param::new("message_id", Schema::Int),
            Param::new("preview", Schema::Str),
        ],
        Schema::Null,
        move |args| {
            let hub = hub.clone();
            let repos = repos.clone();
            async move {
                let sender = resolve_token(&repos, &args).await?;
                let chat_id = require_i64(&args, "chat_id")?;
                let chat_name = require_str(&args, "chat_name")?;
                let sender_username = require_str(&args, "sender_username")?;
                let message_id = require_i64(&args, "message_id")?;
                let preview = require_str(&args, "preview")?;
                hub.send_new_message(
                    chat_id,
                    sender,
                    &sender_username,
                    &chat_name,
                    message_id,
                    &preview,
                )
                .await
                .map_err(|e| HandlerError(e.to_string()))?;
                Ok(Value::Null)
            }
        },
    )
}

fn send_typing(hub: NotifyHub, repos: Repositories) -> Transaction {
    Transaction::new_async(
        "typing",
        vec![
            Param::new("token", Schema::Str),
            Param::new("chat_id", Schema::Int),
        ],
        Schema::Null,
        move |args| {
            let hub = hub.clone();
            let repos = repos.clone();
            async move {
                let user_id = resolve_token(&repos, &args).await?;
                let chat_id = require_i64(&args, "chat_id")?;
                hub.send_typing(chat_id, user_id)
                    .await
                    .map_err(|e| HandlerError(e.to_string()))?;
                Ok(Value::Null)
            }
        },
    )
}

fn mark_read(hub: NotifyHub, repos: Repositories) -> Transaction {
    Transaction::new_async(
        "mark_read",
        vec![
            Param::new("token", Schema::Str),
            Param::new("chat_id", Schema::Int),
            Param::new("message_id", Schema::Int),
        ],
        Schema::Null,
        move |args| {
            let hub = hub.clone();
            let repos = repos.clone();
            async move {
                let reader = resolve_token(&repos, &args).await?;
                let chat_id = require_i64(&args, "chat_id")?;
                let message_id = require_i64(&args, "message_id")?;
                hub.send_read_status(chat_id, message_id, reader)
                    .await
                    .map_err(|e| HandlerError(e.to_string()))?;
                Ok(Value::Null)
            }
        },
    )
}

/// The `updates` stream: the caller's mailbox as a subscription.
///
/// Cancellation (unsubscribe, connection close, shutdown) drops the hub
/// subscription, which runs the offline bookkeeping.
fn updates(hub: NotifyHub) -> Subscription {
    let yields = Schema::Record(
        RecordSchema::new(EVENT_TYPE_NAME)
            .field("type", Schema::Str)
            .field("data", Schema::mapping(Schema::Str, Schema::Any)),
    );
    Subscription::new_async(
        "updates",
        vec![Param::new("token", Schema::Str)],
        yields,
        move |args| {
            let hub = hub.clone();
            Box::pin(async_stream::stream! {
                let Some(token) = args.get("token").and_then(Value::as_str).map(str::to_owned)
                else {
                    yield Err(HandlerError::new("missing argument: token"));
                    return;
                };
                let mut subscription = match hub.subscribe(&token).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        warn!(error = %e, "updates subscription refused");
                        yield Err(HandlerError(e.to_string()));
                        return;
                    }
                };
                while let Some(event) = subscription.next().await {
                    yield Ok(event.into_value());
                }
            })
        },
    )
}

async fn resolve_token(
    repos: &Repositories,
    args: &htcp_protocol::Arguments,
) -> Result<i64, HandlerError> {
    let token = require_str(args, "token")?;
    let record = repos
        .tokens
        .lookup(&token)
        .await
        .map_err(|e| HandlerError(e.to_string()))?
        .ok_or_else(|| HandlerError::new("unknown token"))?;
    Ok(record.user_id)
}

fn require_i64(args: &htcp_protocol::Arguments, name: &str) -> Result<i64, HandlerError> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| HandlerError(format!("missing argument: {name}")))
}

fn require_str(args: &htcp_protocol::Arguments, name: &str) -> Result<String, HandlerError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| HandlerError(format!("missing argument: {name}")))
}
