//! Client-initiated ping/pong keepalive.
//!
//! One task per connection. It sends a Ping `ping_interval` after the
//! handshake, then waits at most `pong_timeout` for a Pong. A Pong (reported
//! by the read loop through [`Keepalive::pong_received`]) clears the deadline
//! and schedules the next Ping. When the deadline passes the `expired` token
//! is cancelled and the read loop tears the connection down.
//!
//! Stopping is idempotent: [`Keepalive::cancel`] and `Drop` abort the task,
//! and aborting a finished or already-aborted task is a no-op.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KeepaliveConfig;
use crate::writer::FrameWriter;

pub(crate) struct Keepalive {
    pongs: Arc<Notify>,
    expired: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Keepalive {
    /// A controller that never pings and never expires.
    pub(crate) fn disabled() -> Self {
        Self {
            pongs: Arc::new(Notify::new()),
            expired: CancellationToken::new(),
            task: None,
        }
    }

    pub(crate) fn spawn(writer: Arc<FrameWriter>, config: KeepaliveConfig) -> Self {
        let pongs = Arc::new(Notify::new());
        let expired = CancellationToken::new();
        let task = tokio::spawn(run(
            writer,
            config,
            Arc::clone(&pongs),
            expired.clone(),
        ));
        Self {
            pongs,
            expired,
            task: Some(task),
        }
    }

    pub(crate) fn pong_received(&self) {
        if self.task.is_some() {
            self.pongs.notify_one();
        }
    }

    /// Resolves once the pong deadline has passed.
    pub(crate) async fn expired(&self) {
        self.expired.cancelled().await;
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(
    writer: Arc<FrameWriter>,
    config: KeepaliveConfig,
    pongs: Arc<Notify>,
    expired: CancellationToken,
) {
    let mut ping_at = Instant::now() + config.ping_interval;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            () = sleep_until(ping_at), if pong_deadline.is_none() => {
                debug!("sending keepalive ping");
                if let Err(e) = writer.send_ping(Vec::new()).await {
                    debug!(error = %e, "keepalive ping could not be written");
                }
                pong_deadline = Some(Instant::now() + config.pong_timeout);
            }
            () = sleep_until_deadline(pong_deadline) => {
                warn!(timeout = ?config.pong_timeout, "no pong received in time, dropping connection");
                expired.cancel();
                return;
            }
            () = pongs.notified() => {
                pong_deadline = None;
                ping_at = Instant::now() + config.ping_interval;
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, Opcode};
    use std::time::Duration;
    use tokio::io::duplex;

    fn timing() -> KeepaliveConfig {
        KeepaliveConfig {
            ping_interval: Duration::from_secs(270),
            pong_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_after_interval_and_reschedules_on_pong() {
        let (client, mut server) = duplex(4096);
        let writer = Arc::new(FrameWriter::new(client, false, 1024));
        let start = Instant::now();
        let keepalive = Keepalive::spawn(writer, timing());

        let ping = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert!(start.elapsed() >= Duration::from_secs(270));

        let ponged_at = Instant::now();
        keepalive.pong_received();

        let ping = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert!(ponged_at.elapsed() >= Duration::from_secs(270));
        assert!(!keepalive.expired.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_expires_after_timeout() {
        let (client, mut server) = duplex(4096);
        let writer = Arc::new(FrameWriter::new(client, false, 1024));
        let keepalive = Keepalive::spawn(writer, timing());

        read_frame(&mut server, 1024).await.unwrap().unwrap();
        let pinged_at = Instant::now();

        tokio::time::timeout(Duration::from_secs(11), keepalive.expired())
            .await
            .unwrap();
        assert!(pinged_at.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_controller_never_expires() {
        let keepalive = Keepalive::disabled();
        keepalive.pong_received();
        let waited = tokio::time::timeout(Duration::from_secs(3600), keepalive.expired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (client, mut server) = duplex(4096);
        let writer = Arc::new(FrameWriter::new(client, false, 1024));
        let mut keepalive = Keepalive::spawn(writer, timing());
        keepalive.cancel();
        keepalive.cancel();
        drop(keepalive);

        // The aborted task drops its writer, so the pipe closes without a ping.
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }
}
