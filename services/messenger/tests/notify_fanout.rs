//! Notify hub fan-out and presence tests.
//!
//! Covers exactly-once-per-queue delivery in program order, the
//! edge-triggered online/offline broadcasts (0→1 and 1→0 transitions
//! only), chat fan-out with exclusion, and the last-online bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use htcp_protocol::arguments;
use messenger::directory::InMemoryDirectory;
use messenger::events::Event;
use messenger::notify::{EventSubscription, NotifyError, NotifyHub};
use messenger::repositories_from_directory;

fn hub_with_directory() -> (NotifyHub, Arc<InMemoryDirectory>) {
    let directory = Arc::new(InMemoryDirectory::default());
    let hub = NotifyHub::new(repositories_from_directory(Arc::clone(&directory)), 64);
    (hub, directory)
}

async fn expect_event(subscription: &mut EventSubscription) -> Event {
    tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("timed out waiting for an event")
        .expect("hub dropped")
}

async fn expect_no_event(subscription: &mut EventSubscription) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), subscription.next()).await;
    assert!(outcome.is_err(), "unexpected event: {outcome:?}");
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(std::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn every_queue_of_a_user_gets_exactly_one_copy_in_order() {
    let (hub, directory) = hub_with_directory();
    for token in ["t1", "t2", "t3"] {
        directory.insert_token(token, 7);
    }

    let mut subs = Vec::new();
    for token in ["t1", "t2", "t3"] {
        subs.push(hub.subscribe(token).await.unwrap());
    }

    let first = Event::new("typing", arguments! {"chat_id" => 1, "user_id" => 9});
    let second = Event::new("read_status", arguments! {"chat_id" => 1, "message_id" => 5});
    hub.notify_user(7, first.clone()).await;
    hub.notify_user(7, second.clone()).await;

    for sub in &mut subs {
        assert_eq!(expect_event(sub).await, first);
        assert_eq!(expect_event(sub).await, second);
        expect_no_event(sub).await;
    }
}

#[tokio::test]
async fn online_and_offline_broadcasts_are_edge_triggered() {
    let (hub, directory) = hub_with_directory();
    directory.insert_token("observer", 2);
    directory.insert_token("t1", 1);
    directory.insert_token("t2", 1);
    directory.add_chat(10, vec![1, 2]);

    let mut observer = hub.subscribe("observer").await.unwrap();
    assert!(!hub.is_online(1).await);

    // 0 → 1: exactly one user_online.
    let first = hub.subscribe("t1").await.unwrap();
    let online = expect_event(&mut observer).await;
    assert_eq!(online.kind, "user_online");
    assert_eq!(
        online.data.get("user_id").and_then(htcp_protocol::Value::as_i64),
        Some(1)
    );
    assert!(hub.is_online(1).await);

    // 1 → 2: silent.
    let second = hub.subscribe("t2").await.unwrap();
    expect_no_event(&mut observer).await;

    // 2 → 1: still online, still silent.
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(hub.is_online(1).await);
    expect_no_event(&mut observer).await;

    // 1 → 0: exactly one user_offline, and last_online_at is recorded.
    drop(second);
    wait_until(|| {
        let hub = hub.clone();
        async move { !hub.is_online(1).await }
    })
    .await;
    let offline = expect_event(&mut observer).await;
    assert_eq!(offline.kind, "user_offline");
    expect_no_event(&mut observer).await;
    assert!(directory.last_online(1).is_some());
}

#[tokio::test]
async fn presence_broadcast_deduplicates_across_shared_chats() {
    let (hub, directory) = hub_with_directory();
    directory.insert_token("observer", 2);
    directory.insert_token("subject", 1);
    // Two chats with the same pair: the observer must still hear about
    // the subject exactly once.
    directory.add_chat(10, vec![1, 2]);
    directory.add_chat(11, vec![1, 2]);

    let mut observer = hub.subscribe("observer").await.unwrap();
    let _subject = hub.subscribe("subject").await.unwrap();

    let online = expect_event(&mut observer).await;
    assert_eq!(online.kind, "user_online");
    expect_no_event(&mut observer).await;
}

#[tokio::test]
async fn notify_chat_expands_members_and_honors_exclusion() {
    let (hub, directory) = hub_with_directory();
    for (token, user) in [("a", 1), ("b", 2), ("c", 3)] {
        directory.insert_token(token, user);
    }
    directory.add_chat(10, vec![1, 2, 3]);

    let mut alice = hub.subscribe("a").await.unwrap();
    let mut bob = hub.subscribe("b").await.unwrap();
    let mut carol = hub.subscribe("c").await.unwrap();

    // Drain the presence chatter caused by the subscribes themselves.
    for sub in [&mut alice, &mut bob, &mut carol] {
        loop {
            match tokio::time::timeout(Duration::from_millis(100), sub.next()).await {
                Ok(Some(event)) if event.kind == "user_online" => {}
                Ok(Some(event)) => panic!("unexpected event {event:?}"),
                _ => break,
            }
        }
    }

    let event = Event::new("typing", arguments! {"chat_id" => 10, "user_id" => 1});
    hub.notify_chat(10, event.clone(), Some(1)).await.unwrap();

    assert_eq!(expect_event(&mut bob).await, event);
    assert_eq!(expect_event(&mut carol).await, event);
    expect_no_event(&mut alice).await;
}

#[tokio::test]
async fn notify_for_an_unknown_user_is_a_silent_noop() {
    let (hub, _directory) = hub_with_directory();
    hub.notify_user(999, Event::new("typing", arguments! {}))
        .await;
    assert!(!hub.is_online(999).await);
}

#[tokio::test]
async fn unknown_token_is_refused() {
    let (hub, _directory) = hub_with_directory();
    match hub.subscribe("nope").await {
        Err(NotifyError::UnknownToken) => {}
        other => panic!("expected UnknownToken, got {other:?}"),
    }
}

#[tokio::test]
async fn member_removed_also_reaches_the_removed_user() {
    let (hub, directory) = hub_with_directory();
    for (token, user) in [("a", 1), ("b", 2), ("r", 3)] {
        directory.insert_token(token, user);
    }
    // User 3 is already out of the chat membership.
    directory.add_chat(10, vec![1, 2]);

    let mut alice = hub.subscribe("a").await.unwrap();
    let mut bob = hub.subscribe("b").await.unwrap();
    let mut removed = hub.subscribe("r").await.unwrap();

    // Presence chatter: 1 and 2 share the chat; 3 shares nothing.
    for sub in [&mut alice, &mut bob] {
        loop {
            match tokio::time::timeout(Duration::from_millis(100), sub.next()).await {
                Ok(Some(event)) if event.kind == "user_online" => {}
                Ok(Some(event)) => panic!("unexpected event {event:?}"),
                _ => break,
            }
        }
    }

    hub.send_member_removed(10, 3, 1).await.unwrap();

    for sub in [&mut alice, &mut bob, &mut removed] {
        let event = expect_event(sub).await;
        assert_eq!(event.kind, "member_removed");
        assert_eq!(
            event
                .data
                .get("removed_user_id")
                .and_then(htcp_protocol::Value::as_i64),
            Some(3)
        );
    }
}

#[tokio::test]
async fn new_message_preview_is_truncated() {
    let (hub, directory) = hub_with_directory();
    directory.insert_token("b", 2);
    directory.add_chat(10, vec![1, 2]);

    let mut bob = hub.subscribe("b").await.unwrap();
    let long: String = "x".repeat(200);
    hub.send_new_message(10, 1, "alice", "general", 44, &long)
        .await
        .unwrap();

    let event = expect_event(&mut bob).await;
    assert_eq!(event.kind, "new_message");
    let preview = event
        .data
        .get("message_content")
        .and_then(htcp_protocol::Value::as_str)
        .unwrap()
        .to_owned();
    assert_eq!(preview.len(), 61);
}

#[tokio::test]
async fn online_user_ids_lists_exactly_the_online_users() {
    let (hub, directory) = hub_with_directory();
    directory.insert_token("a", 1);
    directory.insert_token("b", 2);

    let sub_a = hub.subscribe("a").await.unwrap();
    let _sub_b = hub.subscribe("b").await.unwrap();
    assert_eq!(hub.online_user_ids().await, vec![1, 2]);

    drop(sub_a);
    wait_until(|| {
        let hub = hub.clone();
        async move { hub.online_user_ids().await == vec![2] }
    })
    .await;
}
