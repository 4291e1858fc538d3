//! Attempt counting and backoff selection for the connect loop.

use std::time::Duration;

use crate::config::ReconnectPolicy;
use crate::error::WebSocketError;

#[derive(Debug, Clone)]
pub(crate) struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
    throttled: bool,
}

impl ReconnectState {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            throttled: false,
        }
    }

    /// Counts a new attempt and returns its 1-based number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// The handshake succeeded; the next failure starts counting from zero.
    pub(crate) fn connected(&mut self) {
        self.attempt = 0;
        self.throttled = false;
    }

    pub(crate) fn record_failure(&mut self, err: &WebSocketError) {
        self.throttled = err.is_throttled();
    }

    /// Delay before the next attempt, or `None` once the attempt cap is reached.
    ///
    /// The throttled flag applies to one retry only.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        if std::mem::take(&mut self.throttled) {
            Some(self.policy.throttled_delay)
        } else {
            Some(self.policy.retry_delay)
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
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

    fn throttled() -> WebSocketError {
        WebSocketError::UpgradeRejected {
            status: 429,
            status_line: "HTTP/1.1 429 Too Many Requests".into(),
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let attempts = loop {
            let attempt = state.begin_attempt();
            state.record_failure(&WebSocketError::Timeout);
            if state.next_delay().is_none() {
                break attempt;
            }
        };
        assert_eq!(attempts, 20);
        assert_eq!(state.attempt(), 20);
    }

    #[test]
    fn throttled_failure_waits_longer_once() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.begin_attempt();
        state.record_failure(&throttled());
        assert_eq!(state.next_delay(), Some(Duration::from_secs(60)));

        state.begin_attempt();
        state.record_failure(&WebSocketError::MissingAccept);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn success_resets_the_counter() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        });
        state.begin_attempt();
        state.record_failure(&throttled());
        state.begin_attempt();
        state.connected();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(state.begin_attempt(), 1);
    }
}
