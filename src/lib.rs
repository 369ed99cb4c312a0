//! kv-replicator
//!
//! Change-capture replication for ordered key-value stores.
//!
//! # Features
//!
//! - **Change capture**: every mutation of the primary store lands in an
//!   append-only change log with collision-free, strictly increasing
//!   timestamps
//! - **Service surface**: peers `fetch` keys, check `version` and stream the
//!   change log over line-delimited JSON-RPC
//! - **Secure channel**: optional mutual TLS with an `identify` hook, plus
//!   pluggable `auth` and a per-call `access` predicate
//! - **Replication driver**: periodically pulls a peer's change log from a
//!   persisted watermark and replays it locally
//!
//! # Modules
//!
//! - `storage`: the ordered store interface and the bundled JSONL-backed store
//! - `replication`: capture, metadata store, driver and version checks
//! - `server`: service surface, RPC sessions and the server lifecycle
//! - `security`: TLS credential bundles, authenticators
//! - `protocol`: JSON-RPC frames and the static method table
//! - `client`: RPC client that doubles as a replication peer
//! - `events`: lifecycle and error notifications
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kv_replicator::{ReplicationServer, ServerConfig, Store};
//!
//! #[tokio::main]
//! async fn main() -> kv_replicator::ReplicationResult<()> {
//!     let primary = Arc::new(Store::open("data/primary")?);
//!     let metadata = Arc::new(Store::open("data/replication-set")?);
//!     let server = ReplicationServer::new(primary, metadata, ServerConfig::new().with_port(8000))?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod replication;
pub mod security;
pub mod server;
pub mod storage;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use client::RpcClient;
pub use config::{Listen, RuntimeOptions, ServerConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use events::{EventBus, EventEnvelope, ServerEvent};
pub use replication::{
    CapturePolicy, DriverConfig, IncompatiblePolicy, LocalPeer, ReplicationDriver,
    ReplicationMetadataStore, ReplicationPeer,
};
pub use server::{ReplicationServer, ServiceSurface};
pub use storage::{KvStore, ObservableStore, Store, StoreConfig};
pub use types::{ChangeRecord, ChangeType, PeerIdentity, Timestamp};

/// Library version, written to the version marker at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
