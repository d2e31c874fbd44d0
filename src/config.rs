//! Runtime configuration
//!
//! Tunables live in [`SyncConfig`], read from an optional TOML file. Where to
//! listen, where to dial and which directory to replicate come from the
//! command line (with environment fallbacks) and are bundled into
//! [`ServerConfig`] / [`ClientConfig`].

use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RetryPolicy;
use crate::protocol::{AgentOptions, Role, HANDSHAKE_TEXT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long the peer may stay silent while an acknowledgement is owed.
    pub ack_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Filesystem event debounce window.
    pub debounce_ms: u64,
    /// Quiet period that closes a batch of local changes.
    pub idle_gap_ms: u64,
    /// How long a path written on behalf of the peer is ignored by the
    /// change queue.
    pub echo_window_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            debounce_ms: 100,
            idle_gap_ms: 250,
            echo_window_ms: 2_000,
            max_frame_bytes: crate::protocol::DEFAULT_MAX_FRAME,
        }
    }
}

impl SyncConfig {
    /// Reads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = read_to_string(path)
            .with_context(|| format!("failed to read configuration from {:?}", path))?;
        Self::parse(&content).with_context(|| format!("invalid configuration in {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.ack_timeout_ms > 0, "ack_timeout_ms must be positive");
        anyhow::ensure!(
            self.handshake_timeout_ms > 0,
            "handshake_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.max_frame_bytes >= 1024,
            "max_frame_bytes must be at least 1024"
        );
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn idle_gap(&self) -> Duration {
        Duration::from_millis(self.idle_gap_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    /// Agent settings for one side of a connection.
    pub fn agent_options(&self, role: Role) -> AgentOptions {
        AgentOptions {
            role,
            ack_timeout: self.ack_timeout(),
            handshake_timeout: self.handshake_timeout(),
            max_frame: self.max_frame_bytes,
            handshake_text: HANDSHAKE_TEXT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub bind: SocketAddr,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub root: PathBuf,
    pub remote_host: String,
    pub port: u16,
    pub sync: SyncConfig,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.port)
    }
}
