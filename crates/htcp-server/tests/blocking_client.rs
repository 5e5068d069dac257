//! The blocking client against a live async server.  Blocking calls run
//! on the blocking pool so the server's reactor keeps turning.

use std::time::Duration;

use htcp_client::blocking::BlockingClient;
use htcp_client::{ClientConfig, ClientError};
use htcp_protocol::{arguments, ErrorCode, Schema, Value};
use htcp_server::{Server, ServerConfig, ServerHandle, Subscription, Transaction};

async fn start_server() -> ServerHandle {
    let server = Server::new(ServerConfig {
        name: "blocking-test".to_owned(),
        host: "127.0.0.1".to_owned(),
        port: 0,
        ..ServerConfig::default()
    });
    server
        .register_transaction(Transaction::new_async(
            "echo",
            vec![],
            Schema::Any,
            |args| async move { Ok(args.get("x").cloned().unwrap_or(Value::Null)) },
        ))
        .unwrap();
    server
        .register_subscription(Subscription::new_async(
            "ticks",
            vec![],
            Schema::Int,
            |_args| {
                Box::pin(async_stream::stream! {
                    for i in 1i64..=3 {
                        yield Ok(Value::from(i));
                    }
                })
            },
        ))
        .unwrap();
    server
        .register_subscription(Subscription::new_async(
            "metronome",
            vec![],
            Schema::Int,
            |_args| {
                Box::pin(async_stream::stream! {
                    let mut beat: i64 = 0;
                    loop {
                        yield Ok(Value::from(beat));
                        beat += 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
            },
        ))
        .unwrap();
    server.start().await.unwrap()
}

#[tokio::test]
async fn blocking_call_roundtrips() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let result = tokio::task::spawn_blocking(move || {
        let mut client = BlockingClient::connect(addr, ClientConfig::default())?;
        assert_eq!(client.server_info().server_name, "blocking-test");
        let value = client.call("echo", arguments! {"x" => 17})?;
        client.close();
        Ok::<Value, ClientError>(value)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result, Value::from(17));
    handle.shutdown().await;
}

#[tokio::test]
async fn blocking_unknown_transaction_error() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let err = tokio::task::spawn_blocking(move || {
        let mut client = BlockingClient::connect(addr, ClientConfig::default())?;
        client.call("nope", arguments! {})?;
        Ok::<Value, ClientError>(Value::Null)
    })
    .await
    .unwrap()
    .unwrap_err();

    match err {
        ClientError::Call { error_code, .. } => {
            assert_eq!(error_code, ErrorCode::UnknownTransaction);
        }
        other => panic!("expected call error, got {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn blocking_subscription_iterates_to_the_end() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let items = tokio::task::spawn_blocking(move || {
        let mut client = BlockingClient::connect(addr, ClientConfig::default())?;
        let items: Result<Vec<Value>, ClientError> =
            client.subscribe("ticks", arguments! {})?.collect();
        client.close();
        items
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        items,
        vec![Value::from(1), Value::from(2), Value::from(3)]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn blocking_drop_mid_stream_unsubscribes() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let client_task = tokio::task::spawn_blocking(move || {
        let mut client = BlockingClient::connect(addr, ClientConfig::default())?;
        {
            let mut stream = client.subscribe("metronome", arguments! {})?;
            let first = stream.next().expect("stream yielded nothing")?;
            assert_eq!(first, Value::from(0));
            // Dropping the handle here sends the unsubscribe.
        }
        // The connection remains usable.
        let value = client.call("echo", arguments! {"x" => 1});
        client.close();
        value
    });

    let result = client_task.await.unwrap();
    match result {
        Ok(value) => assert_eq!(value, Value::from(1)),
        // A buffered data packet may race the unsubscribe on the shared
        // stream; that is the documented channel limitation.
        Err(ClientError::UnexpectedPacket(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while handle.active_subscriptions() > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "producer survived the dropped iterator"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;
}
