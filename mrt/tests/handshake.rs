//! Integration tests for connection setup and teardown.
//!
//! Each test binds real endpoints on loopback, runs the server half in a
//! background task, and checks the states both sides reach.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mrt::{Client, Config, ConnectionState, MrtError, Phase, Server};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn quick() -> Config {
    Config::with_timeout(Duration::from_millis(100)).retries(3)
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn bind_server(capacity: u32) -> Server {
    Server::bind(loopback(), capacity, quick())
        .await
        .expect("bind server")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake, and both
/// should close cleanly afterwards.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let mut server = bind_server(1000).await;
    let server_addr = server.local_addr();

    let server_task = tokio::spawn(async move {
        let conn = server.accept().await.expect("accept");
        assert_eq!(server.state(), ConnectionState::Established);
        server.close().await.expect("server close");
        (conn, server.state())
    });

    let mut client = Client::bind(loopback(), server_addr, 100, quick())
        .await
        .expect("bind client");
    assert_eq!(client.state(), ConnectionState::Closed);
    tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect hung")
        .expect("connect");
    assert_eq!(client.state(), ConnectionState::Established);

    client.close().await.expect("client close");
    assert_eq!(client.state(), ConnectionState::Closed);

    let (conn, server_state) = server_task.await.unwrap();
    assert_eq!(conn.peer(), client.local_addr());
    assert_eq!(server_state, ConnectionState::Closed);
}

/// A peer that never answers exhausts the handshake budget in roughly
/// `retries × timeout`.
#[tokio::test]
async fn connect_to_silent_peer_fails() {
    let silent = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
    let mut client = Client::bind(loopback(), silent.local_addr().unwrap(), 100, quick())
        .await
        .unwrap();

    let started = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect hung")
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        MrtError::ConnectionFailure {
            phase: Phase::Handshake,
            attempts: 3
        }
    );
    assert!(elapsed >= Duration::from_millis(250), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    // The failure sticks.
    assert_eq!(client.send(b"x").await.unwrap_err(), err);
}

#[tokio::test]
async fn connect_twice_is_harmless() {
    let mut server = bind_server(1000).await;
    let server_addr = server.local_addr();
    let server_task = tokio::spawn(async move {
        server.accept().await.expect("accept");
        server.close().await.expect("server close");
    });

    let mut client = Client::bind(loopback(), server_addr, 100, quick()).await.unwrap();
    client.connect().await.unwrap();
    client.connect().await.unwrap();
    client.close().await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn close_before_connect_returns() {
    let server = bind_server(1000).await;
    let mut client = Client::bind(loopback(), server.local_addr(), 100, quick())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), client.close())
        .await
        .expect("close hung")
        .unwrap();
    // Second close is a no-op.
    client.close().await.unwrap();
}

#[tokio::test]
async fn send_after_close_is_rejected() {
    let mut server = bind_server(1000).await;
    let server_addr = server.local_addr();
    let server_task = tokio::spawn(async move {
        server.accept().await.expect("accept");
        server.close().await.expect("server close");
    });

    let mut client = Client::bind(loopback(), server_addr, 100, quick()).await.unwrap();
    client.connect().await.unwrap();
    client.close().await.unwrap();
    assert!(matches!(
        client.send(b"late").await,
        Err(MrtError::BadState(_))
    ));
    server_task.await.unwrap();
}
