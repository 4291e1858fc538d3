//! # IRC Chat Example
//!
//! Joins a Twitch chat channel anonymously over `wss://` and prints every
//! chat line. The IRC layer here is deliberately tiny; it only shows that a
//! line protocol needs nothing beyond `write` and the event stream.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example irc_chat -- rustlang
//! ```
//!
//! Press Ctrl-C to send a normal close and exit.

use deflate_ws_client::{ClientConfig, Event, WebSocketClient};

const TWITCH_IRC: &str = "wss://irc-ws.chat.twitch.tv:443";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let channel = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rustlang".to_string())
        .to_lowercase();

    // ── Configuration ───────────────────────────────────────────────
    let config = ClientConfig::new(TWITCH_IRC).with_client_pings(true);
    let (client, mut events) = WebSocketClient::with_events(config)?;
    client.start();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::Connected => {
                        // Anonymous login: any `justinfan<N>` nick with any password.
                        client.write("CAP REQ :twitch.tv/tags twitch.tv/commands").await?;
                        client.write("PASS SCHMOOPIIE").await?;
                        client.write("NICK justinfan12345").await?;
                        client.write(&format!("JOIN #{channel}")).await?;
                        println!("connected, joining #{channel}");
                    }
                    Event::Message(text) => {
                        for line in text.lines() {
                            handle_line(&client, line).await?;
                        }
                    }
                    Event::Disconnected { message, detail } => {
                        println!(
                            "disconnected: {message}{}",
                            detail.map(|d| format!(" ({d})")).unwrap_or_default()
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("closing");
                client.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}

async fn handle_line(client: &WebSocketClient, line: &str) -> deflate_ws_client::Result<()> {
    if let Some(server) = line.strip_prefix("PING ") {
        return client.write(&format!("PONG {server}")).await;
    }

    // [@tags] :nick!user@host PRIVMSG #channel :text
    let without_tags = match line.strip_prefix('@') {
        Some(rest) => rest.split_once(' ').map_or("", |(_, rest)| rest),
        None => line,
    };
    let Some((prefix, rest)) = without_tags.strip_prefix(':').and_then(|l| l.split_once(' ')) else {
        return Ok(());
    };
    if let Some(rest) = rest.strip_prefix("PRIVMSG ") {
        if let Some((target, text)) = rest.split_once(" :") {
            let nick = prefix.split('!').next().unwrap_or(prefix);
            println!("{target} <{nick}> {text}");
        }
    }
    Ok(())
}
