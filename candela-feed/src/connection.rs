//! Connection machinery shared by the market-data client and the state-sync
//! channel: the connection state machine, the bounded-retry policy and the
//! idle deadline that detects stalled-but-open sockets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Lifecycle of one socket connection.
///
/// `Closed` and `Errored` are both terminal for a single attempt and flow
/// back into `Disconnected`; from there the retry policy decides whether a
/// new `Connecting` attempt starts automatically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fixed-backoff reconnect policy with a bounded attempt count.
///
/// Attempts reset to zero every time a connection reaches `Open`; once they
/// are exhausted the client parks at `Disconnected` until an explicit
/// reconnect is requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Clip an inbound payload for log output.
///
/// Backs off to the nearest character boundary so a multibyte sequence
/// straddling the cut can never panic the read loop; malformed frames are
/// logged and dropped, never thrown.
pub(crate) fn log_snippet(text: &str) -> &str {
    const MAX_LEN: usize = 100;
    if text.len() <= MAX_LEN {
        return text;
    }
    let mut end = MAX_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Deadline that fires when a connection has been silent for too long.
///
/// Every inbound frame resets it, so on a healthy feed it never fires; a
/// socket that is open but no longer delivering (half-dead NAT entry,
/// silently dropped peer) trips it and the normal reconnect path runs. This
/// stands in for server-side pong tracking.
pub struct IdleDeadline {
    sleep: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl IdleDeadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(timeout)),
            timeout,
        }
    }

    /// Push the deadline out by the full timeout; call on every inbound
    /// frame.
    pub fn reset(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    /// Resolves when the connection has been idle for the whole timeout.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await
    }
}
