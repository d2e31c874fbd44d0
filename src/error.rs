//! Error taxonomy and retry logic
//!
//! Transport and protocol failures are typed so the agent can decide what
//! tears a connection down; application boundaries wrap them in `anyhow`.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Failures of the framed byte stream underneath an agent.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed control message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Could not encode control message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Control frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("File transfer size mismatch: expected {expected} bytes, moved {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Timed out waiting for the peer")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// Wire paths that cannot be mapped under a sync root.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Path escapes the sync root: {0}")]
    Traversal(String),

    #[error("Path is outside the sync root: {0}")]
    OutsideRoot(PathBuf),
}

/// Failures of the connection protocol state machine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Bad handshake: expected {expected:?}, got {actual:?}")]
    BadHandshake { expected: String, actual: String },

    #[error("Message {0} received before handshake")]
    HandshakeRequired(&'static str),

    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("Mutating operation outside of a transaction")]
    NotInTransaction,

    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Peer reported failure: {0}")]
    PeerFailed(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Local file missing: {}", .0.display())]
    LocalFileMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::LocalFileMissing(_))
    }

    /// Whether the peer should be told about the failure before closing.
    /// A peer that already failed, or a dead stream, gets nothing.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(
            self,
            ProtocolError::PeerFailed(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Transport(TransportError::Closed)
                | ProtocolError::Transport(TransportError::Io(_))
                | ProtocolError::Transport(TransportError::Timeout)
        )
    }
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts.max(1) {
                    return Err(anyhow::anyhow!(
                        "Operation failed after {} attempts: {}",
                        attempts,
                        e
                    ));
                }

                warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "retrying in {:?}",
                    delay
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
