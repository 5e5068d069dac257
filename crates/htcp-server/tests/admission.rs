//! Bounded connection admission: the registry's test-and-insert must be
//! atomic under concurrent connects, and rejected clients observe an
//! immediate close with no packet.

use htcp_protocol::message::HandshakeRequest;
use htcp_protocol::PacketType;
use htcp_server::{Server, ServerConfig, ServerHandle};
use htcp_test_utils::RawPeer;

async fn start_bounded_server(max_connections: usize) -> ServerHandle {
    let server = Server::new(ServerConfig {
        name: "bounded".to_owned(),
        host: "127.0.0.1".to_owned(),
        port: 0,
        max_connections,
        ..ServerConfig::default()
    });
    server.start().await.unwrap()
}

/// Outcome of one probe connection: completed handshake, or closed with
/// no bytes at all.
enum Outcome {
    Admitted(RawPeer),
    Rejected,
}

async fn probe(addr: std::net::SocketAddr) -> Outcome {
    let mut peer = RawPeer::connect(addr).await;
    if peer
        .try_send_packet(&HandshakeRequest.to_packet())
        .await
        .is_err()
    {
        // The server reset the stream before our handshake got out.
        return Outcome::Rejected;
    }
    match peer.try_recv_packet().await {
        Ok(packet) => {
            assert_eq!(packet.packet_type, PacketType::HandshakeResponse);
            Outcome::Admitted(peer)
        }
        Err(e) => {
            assert!(
                e.is_connection_error(),
                "rejected client saw {e:?} instead of a bare close"
            );
            Outcome::Rejected
        }
    }
}

#[tokio::test]
async fn the_bound_plus_one_client_is_closed_without_a_packet() {
    let handle = start_bounded_server(2).await;
    let addr = handle.local_addr();

    let first = probe(addr).await;
    let second = probe(addr).await;
    assert!(matches!(first, Outcome::Admitted(_)));
    assert!(matches!(second, Outcome::Admitted(_)));
    assert_eq!(handle.connection_count().await, 2);

    // Third connection: closed immediately, no packet.
    assert!(matches!(probe(addr).await, Outcome::Rejected));
    assert_eq!(handle.connection_count().await, 2);

    drop(first);
    drop(second);
    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_connects_admit_exactly_the_bound() {
    const BOUND: usize = 3;
    const PROBES: usize = 8;

    let handle = start_bounded_server(BOUND).await;
    let addr = handle.local_addr();

    let mut tasks = Vec::new();
    for _ in 0..PROBES {
        tasks.push(tokio::spawn(probe(addr)));
    }

    let mut admitted = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Outcome::Admitted(peer) => admitted.push(peer),
            Outcome::Rejected => rejected += 1,
        }
    }

    assert_eq!(admitted.len(), BOUND);
    assert_eq!(rejected, PROBES - BOUND);
    assert_eq!(handle.connection_count().await, BOUND);

    drop(admitted);
    handle.shutdown().await;
}

#[tokio::test]
async fn a_freed_slot_becomes_available_again() {
    let handle = start_bounded_server(1).await;
    let addr = handle.local_addr();

    let first = probe(addr).await;
    assert!(matches!(first, Outcome::Admitted(_)));
    assert!(matches!(probe(addr).await, Outcome::Rejected));

    drop(first);
    // Wait for the server to reap the closed connection.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while handle.connection_count().await > 0 {
        assert!(std::time::Instant::now() < deadline, "slot never freed");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(matches!(probe(addr).await, Outcome::Admitted(_)));
    handle.shutdown().await;
}

#[tokio::test]
async fn zero_bound_means_unbounded() {
    let handle = start_bounded_server(0).await;
    let addr = handle.local_addr();

    let mut peers = Vec::new();
    for _ in 0..10 {
        match probe(addr).await {
            Outcome::Admitted(peer) => peers.push(peer),
            Outcome::Rejected => panic!("unbounded server rejected a connection"),
        }
    }
    assert_eq!(handle.connection_count().await, 10);

    drop(peers);
    handle.shutdown().await;
}
