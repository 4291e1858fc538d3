//! End-to-end client tests against a scripted in-memory server.
//!
//! Uses the shared `MockConnector` from `tests/common` so each test drives
//! the server side of the handshake and framing, and observes the client
//! through its event channel and state watch.

mod common;

use std::time::Duration;

use deflate_ws_client::deflate;
use deflate_ws_client::frame::{Frame, Opcode, CLOSE_NORMAL};
use deflate_ws_client::{ConnectionState, Event, ReconnectPolicy, WebSocketError};
use tokio::time::Instant;

use common::{config, harness, harness_with, header, Harness, MockConnector};

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_disconnect(events: &mut tokio::sync::mpsc::Receiver<Event>) -> Option<String> {
    match next_event(events).await {
        Event::Disconnected { detail, .. } => detail,
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Handshake and messages
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn upgrade_request_carries_extra_headers() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config().with_header("Origin", "https://www.twitch.tv"));
    client.start();

    let mut server = servers.recv().await.unwrap();
    let request = server.accept(false).await;
    assert!(request.starts_with("GET / HTTP/1.1\r\n"));
    assert_eq!(header(&request, "Host").as_deref(), Some("irc-ws.chat.twitch.tv"));
    assert_eq!(header(&request, "Upgrade").as_deref(), Some("websocket"));
    assert_eq!(header(&request, "Sec-WebSocket-Version").as_deref(), Some("13"));
    assert_eq!(
        header(&request, "Sec-WebSocket-Extensions").as_deref(),
        Some("permessage-deflate")
    );
    assert_eq!(header(&request, "Origin").as_deref(), Some("https://www.twitch.tv"));

    assert_eq!(next_event(&mut events).await, Event::Connected);
    assert!(client.is_connected());
}

#[tokio::test]
async fn delivers_messages_and_writes_masked_text() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    server.send(Frame::text(":tmi.twitch.tv 001 justinfan :Welcome")).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(":tmi.twitch.tv 001 justinfan :Welcome".into())
    );

    client.write("JOIN #rustlang").await.unwrap();
    let frame = server.recv().await.unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(frame.fin);
    assert!(!frame.compressed);
    assert_eq!(frame.payload, b"JOIN #rustlang");
}

#[tokio::test]
async fn reassembles_fragmented_message() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let mut head = Frame::text("{\"type\":");
    head.fin = false;
    server.send(head).await;
    server.send(Frame::continuation(&b"\"MESSAGE\","[..], false)).await;
    server.send(Frame::continuation(&b"\"data\":{}}"[..], true)).await;

    assert_eq!(
        next_event(&mut events).await,
        Event::Message("{\"type\":\"MESSAGE\",\"data\":{}}".into())
    );
}

#[tokio::test]
async fn compressed_messages_flow_both_ways() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(true).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let mut incoming = Frame::text(String::new());
    incoming.payload = deflate::deflate(b"{\"type\":\"PONG\"}").unwrap();
    incoming.compressed = true;
    server.send(incoming).await;
    assert_eq!(
        next_event(&mut events).await,
        Event::Message("{\"type\":\"PONG\"}".into())
    );

    let outgoing = "{\"type\":\"LISTEN\",\"data\":{\"topics\":[\"channel-points\"]}}".repeat(30);
    client.write(&outgoing).await.unwrap();
    let frame = server.recv().await.unwrap();
    assert!(frame.compressed);
    assert_eq!(
        deflate::inflate(&frame.payload, common::SERVER_LIMIT).unwrap(),
        outgoing.as_bytes()
    );

    client.write("short").await.unwrap();
    let frame = server.recv().await.unwrap();
    assert!(!frame.compressed);
    assert_eq!(frame.payload, b"short");
}

#[tokio::test]
async fn write_without_connection_fails() {
    let Harness { client, .. } = harness(config());
    assert!(matches!(
        client.write("PING").await,
        Err(WebSocketError::NotConnected)
    ));
}

// ════════════════════════════════════════════════════════════════════
// Control frames
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_ping_gets_exactly_one_pong() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    let client = std::sync::Arc::new(client);
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    server.send(Frame::ping(b"tmi".to_vec())).await;
    let pong = server.recv().await.unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"tmi");

    // No message for the ping; the next event is the text that follows it.
    server.send(Frame::text("after")).await;
    assert_eq!(next_event(&mut events).await, Event::Message("after".into()));

    // The next frame from the client is the Close, not a second Pong.
    let closing = tokio::spawn({
        let client = std::sync::Arc::clone(&client);
        async move { client.disconnect().await }
    });
    let close = server.recv().await.unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    server.send(Frame::close(CLOSE_NORMAL)).await;
    closing.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn server_close_is_echoed_and_socket_closes() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    server.send(Frame::close(CLOSE_NORMAL)).await;
    let closed_at = Instant::now();
    let echo = server.recv().await.unwrap();
    assert_eq!(echo.opcode, Opcode::Close);
    assert_eq!(echo.close_code(), Some(CLOSE_NORMAL));
    assert!(server.recv().await.is_none());
    assert!(closed_at.elapsed() < Duration::from_secs(5));

    assert_eq!(
        expect_disconnect(&mut events).await.as_deref(),
        Some("close code 1000")
    );

    // A server close is an ordinary disconnect: the client comes back after 1s.
    let mut second = servers.recv().await.unwrap();
    assert!(closed_at.elapsed() >= Duration::from_secs(1));
    second.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
}

// ════════════════════════════════════════════════════════════════════
// Keepalive
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn missing_pong_closes_and_reconnects() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config().with_client_pings(true));
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    let connected_at = Instant::now();
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let ping = server.recv().await.unwrap();
    assert_eq!(ping.opcode, Opcode::Ping);
    assert!(connected_at.elapsed() >= Duration::from_secs(270));
    let pinged_at = Instant::now();

    assert_eq!(
        expect_disconnect(&mut events).await.as_deref(),
        Some("pong timeout")
    );
    assert!(pinged_at.elapsed() >= Duration::from_secs(10));

    let mut second = servers.recv().await.unwrap();
    second.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
}

#[tokio::test(start_paused = true)]
async fn pong_keeps_connection_alive() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config().with_client_pings(true));
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    for _ in 0..3 {
        let ping = server.recv().await.unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        server.send(Frame::pong(ping.payload)).await;
    }
    assert!(client.is_connected());
    assert!(events.try_recv().is_err());
}

// ════════════════════════════════════════════════════════════════════
// Reconnect policy
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn gives_up_after_twenty_failures() {
    let (connector, servers) = MockConnector::new();
    let connector = connector.failing_with(|_| {
        Some(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
    });
    let Harness {
        client,
        mut events,
        attempts,
        attempt_times,
        ..
    } = harness_with(config(), connector, servers);
    let mut state = client.watch_state();
    client.start();

    for _ in 0..20 {
        assert!(expect_disconnect(&mut events).await.is_some());
    }
    state
        .wait_for(|state| *state == ConnectionState::Idle)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 20);
    assert!(events.try_recv().is_err());

    let times = attempt_times.lock().unwrap().clone();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_secs(2));
    }
}

#[tokio::test(start_paused = true)]
async fn throttled_upgrade_backs_off_sixty_seconds() {
    let Harness {
        client,
        mut events,
        mut servers,
        attempt_times,
        ..
    } = harness(config());
    client.start();

    let mut first = servers.recv().await.unwrap();
    first.reject("HTTP/1.1 429 Too Many Requests").await;
    let detail = expect_disconnect(&mut events).await.unwrap();
    assert!(detail.contains("429"));

    let mut second = servers.recv().await.unwrap();
    second.reject("HTTP/1.1 503 Service Unavailable").await;
    expect_disconnect(&mut events).await;

    let mut third = servers.recv().await.unwrap();
    third.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let times = attempt_times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    let throttled_gap = times[1] - times[0];
    let normal_gap = times[2] - times[1];
    assert!(throttled_gap >= Duration::from_secs(60));
    assert!(normal_gap >= Duration::from_secs(1) && normal_gap < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn bad_accept_is_retried() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut first = servers.recv().await.unwrap();
    first.read_request().await;
    first
        .write_raw(b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: bogus\r\n\r\n")
        .await;
    let detail = expect_disconnect(&mut events).await.unwrap();
    assert!(detail.contains("Sec-WebSocket-Accept"));

    let mut second = servers.recv().await.unwrap();
    second.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
}

#[tokio::test(start_paused = true)]
async fn tls_failure_is_fatal() {
    let (connector, servers) = MockConnector::new();
    let connector = connector
        .failing_with(|_| Some(WebSocketError::Tls("invalid peer certificate: UnknownIssuer".into())));
    let Harness {
        client,
        mut events,
        attempts,
        ..
    } = harness_with(config(), connector, servers);
    client.start();

    let detail = expect_disconnect(&mut events).await.unwrap();
    assert!(detail.contains("UnknownIssuer"));
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn successful_connection_resets_attempt_counter() {
    let policy = ReconnectPolicy {
        max_attempts: 2,
        ..ReconnectPolicy::default()
    };
    let Harness {
        client,
        mut events,
        mut servers,
        attempts,
        ..
    } = harness(config().with_reconnect(policy));
    client.start();

    // fail, connect, fail, fail: four attempts in total with a cap of two.
    let mut conn = servers.recv().await.unwrap();
    conn.reject("HTTP/1.1 500 Internal Server Error").await;
    expect_disconnect(&mut events).await;

    let mut conn = servers.recv().await.unwrap();
    conn.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);
    drop(conn);
    expect_disconnect(&mut events).await;

    for _ in 0..2 {
        let mut conn = servers.recv().await.unwrap();
        conn.reject("HTTP/1.1 500 Internal Server Error").await;
        expect_disconnect(&mut events).await;
    }

    let mut state = client.watch_state();
    state
        .wait_for(|state| *state == ConnectionState::Idle)
        .await
        .unwrap();
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
}

// ════════════════════════════════════════════════════════════════════
// Disconnect
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn disconnect_sends_normal_close_and_stops() {
    let Harness {
        client,
        mut events,
        mut servers,
        attempts,
        ..
    } = harness(config());
    let client = std::sync::Arc::new(client);
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let closing = tokio::spawn({
        let client = std::sync::Arc::clone(&client);
        async move { client.disconnect().await }
    });

    let close = server.recv().await.unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_code(), Some(CLOSE_NORMAL));
    server.send(Frame::close(CLOSE_NORMAL)).await;

    let started = Instant::now();
    closing.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(server.recv().await.is_none());
    assert!(matches!(next_event(&mut events).await, Event::Disconnected { .. }));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(servers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_forces_close_when_server_is_silent() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config());
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let started = Instant::now();
    client.disconnect().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));

    let close = server.recv().await.unwrap();
    assert_eq!(close.close_code(), Some(CLOSE_NORMAL));
    assert!(server.recv().await.is_none());
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_when_listener_is_stuck() {
    let Harness {
        client,
        mut events,
        mut servers,
        ..
    } = harness(config().with_event_channel_capacity(1));
    client.start();

    let mut server = servers.recv().await.unwrap();
    server.accept(false).await;
    client
        .watch_state()
        .wait_for(|state| *state == ConnectionState::Open)
        .await
        .unwrap();

    // `Connected` stays queued, so the Disconnected send has nowhere to go.
    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(60), client.disconnect())
        .await
        .expect("disconnect should not wait on the listener forever");
    assert!(started.elapsed() < Duration::from_secs(11));
    assert_eq!(client.state(), ConnectionState::Closed);

    let close = server.recv().await.unwrap();
    assert_eq!(close.close_code(), Some(CLOSE_NORMAL));
    assert!(server.recv().await.is_none());
    assert_eq!(events.recv().await, Some(Event::Connected));
}
