//! Loading `ClientConfig` from host application settings.
//!
//! Only built with the `serde` feature.

#![cfg(feature = "serde")]

use std::time::Duration;

use deflate_ws_client::{ClientConfig, KeepaliveConfig, ReconnectPolicy};

#[test]
fn minimal_toml_uses_defaults() {
    let config: ClientConfig = toml::from_str(r#"url = "wss://pubsub-edge.example.com""#).unwrap();
    assert_eq!(config, ClientConfig::new("wss://pubsub-edge.example.com"));
}

#[test]
fn toml_overrides_in_milliseconds() {
    let config: ClientConfig = toml::from_str(
        r#"
        url = "wss://irc-ws.chat.twitch.tv:443"
        client_pings = true
        connect_timeout_ms = 2500

        [headers]
        Origin = "https://www.twitch.tv"

        [keepalive]
        ping_interval_ms = 60000

        [reconnect]
        max_attempts = 5
        throttled_delay_ms = 30000
        "#,
    )
    .unwrap();

    assert!(config.client_pings);
    assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    assert_eq!(
        config.headers.get("Origin").map(String::as_str),
        Some("https://www.twitch.tv")
    );
    assert_eq!(
        config.keepalive,
        KeepaliveConfig {
            ping_interval: Duration::from_secs(60),
            ..KeepaliveConfig::default()
        }
    );
    assert_eq!(
        config.reconnect,
        ReconnectPolicy {
            max_attempts: 5,
            throttled_delay: Duration::from_secs(30),
            ..ReconnectPolicy::default()
        }
    );
}

#[test]
fn json_serialization_round_trips() {
    let config = ClientConfig::new("ws://127.0.0.1:9000/events")
        .with_header("Client-Id", "abc123")
        .with_close_timeout(Duration::from_millis(750));
    let json = serde_json::to_value(&config).unwrap();

    assert_eq!(json["close_timeout_ms"], 750);
    assert_eq!(json["keepalive"]["pong_timeout_ms"], 10_000);
    assert_eq!(json["reconnect"]["retry_delay_ms"], 1_000);

    let back: ClientConfig = serde_json::from_value(json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn missing_url_is_an_error() {
    let result: Result<ClientConfig, _> = toml::from_str("client_pings = true");
    assert!(result.is_err());
}
