//! # dirsync - transactional directory replication
//!
//! One server and any number of clients keep a directory tree identical.
//! Every change travels as a transaction of file/directory operations over a
//! framed TCP protocol, and the server forwards each client's committed
//! changes to every other client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dirsync::config::{ServerConfig, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig {
//!         root: "./shared".into(),
//!         bind: "0.0.0.0:8080".parse()?,
//!         sync: SyncConfig::default(),
//!     };
//!     dirsync::server::start(config).await
//! }
//! ```

pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tree;
pub mod watcher;

// Re-export main types for library consumers
pub use config::{ClientConfig, ServerConfig, SyncConfig};
pub use diff::Diff;
pub use error::{PathError, ProtocolError, ProtocolResult, RetryPolicy, TransportError};
pub use protocol::{Agent, AgentOptions, Message, Role};
pub use server::ConnectionManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
