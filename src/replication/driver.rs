//! Replication driver: pull a peer's change log into the local store
//!
//! ```text
//! tick ──► peer.version() ──► compatible? ──► changes_since(watermark)
//!                                              │
//!          set_watermark ◄── write(Replicated) ◄┘  (ascending, batched)
//! ```
//!
//! A failed cycle is reported on the event bus and retried on the next tick.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{compat, ReadStreamOptions, ReplicationMetadataStore};
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::{EventBus, ServerEvent};
use crate::server::ServiceSurface;
use crate::storage::{KvStore, ObservableStore};
use crate::types::{ChangeRecord, ChangeType, MutationOrigin, PeerIdentity, Timestamp, WriteOp};

/// What to do when a peer reports an incompatible version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IncompatiblePolicy {
    /// End the cycle after reporting it
    #[default]
    Skip,
    /// Report it and replicate anyway
    Proceed,
}

impl FromStr for IncompatiblePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(IncompatiblePolicy::Skip),
            "proceed" => Ok(IncompatiblePolicy::Proceed),
            other => Err(format!(
                "unknown incompatible-version policy '{}' (expected skip or proceed)",
                other
            )),
        }
    }
}

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub interval: Duration,
    /// Change records requested per round trip
    pub batch_size: usize,
    pub on_incompatible: IncompatiblePolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 512,
            on_incompatible: IncompatiblePolicy::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_incompatible_policy(mut self, policy: IncompatiblePolicy) -> Self {
        self.on_incompatible = policy;
        self
    }
}

/// A remote service surface the driver can pull from
pub trait ReplicationPeer: Send + Sync {
    /// Stable name; watermarks are kept per name
    fn name(&self) -> &str;

    fn version(&self) -> impl Future<Output = ReplicationResult<String>> + Send;

    /// Current value of `key`; `NotFound` when absent
    fn fetch(&self, key: &str) -> impl Future<Output = ReplicationResult<Value>> + Send;

    /// Up to `limit` change records strictly after `after`, ascending
    fn changes_since(
        &self,
        after: Option<Timestamp>,
        limit: usize,
    ) -> impl Future<Output = ReplicationResult<Vec<ChangeRecord>>> + Send;
}

/// Result of one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied {
        applied: usize,
        watermark: Option<Timestamp>,
    },
    /// Peer version was incompatible and the policy is `Skip`
    Skipped { remote_version: String },
}

/// Applies a peer's changes to the local primary store
pub struct ReplicationDriver {
    primary: Arc<dyn ObservableStore>,
    metadata: Arc<ReplicationMetadataStore>,
    events: EventBus,
    config: DriverConfig,
    /// Fallback when the metadata store has no version marker
    local_version: String,
}

impl ReplicationDriver {
    pub fn new(
        primary: Arc<dyn ObservableStore>,
        metadata: Arc<ReplicationMetadataStore>,
        events: EventBus,
        config: DriverConfig,
        local_version: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            metadata,
            events,
            config,
            local_version: local_version.into(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run one reconciliation against `peer`
    pub async fn run_cycle<P: ReplicationPeer>(&self, peer: &P) -> ReplicationResult<CycleOutcome> {
        let name = peer.name().to_string();
        let remote_version = peer.version().await?;
        let local_version = self
            .metadata
            .version()?
            .unwrap_or_else(|| self.local_version.clone());

        if compat::is_compatible(&local_version, &remote_version) {
            self.events.emit(ServerEvent::Compatible {
                version: remote_version,
            });
        } else {
            tracing::warn!(
                peer = %name,
                local = %local_version,
                remote = %remote_version,
                policy = ?self.config.on_incompatible,
                "incompatible peer version"
            );
            self.events.emit(ServerEvent::Incompatible {
                local: local_version,
                remote: remote_version.clone(),
            });
            if self.config.on_incompatible == IncompatiblePolicy::Skip {
                return Ok(CycleOutcome::Skipped { remote_version });
            }
        }

        let mut watermark = self.metadata.watermark(&name)?;
        let mut applied = 0;

        loop {
            let batch = peer.changes_since(watermark, self.config.batch_size).await?;
            let full = batch.len() >= self.config.batch_size;
            let before = watermark;

            for record in batch {
                if watermark.is_some_and(|w| record.timestamp <= w) {
                    continue;
                }
                self.apply(peer, &name, &record).await?;
                self.metadata.set_watermark(&name, record.timestamp)?;
                watermark = Some(record.timestamp);
                applied += 1;
            }

            // A full batch that moved nothing would be requested forever
            if !full || watermark == before {
                break;
            }
        }

        if applied > 0 {
            tracing::info!(peer = %name, applied, watermark = ?watermark, "replicated changes");
            self.events.emit(ServerEvent::Replicated {
                peer: name,
                applied,
                watermark: watermark.map(|w| w.0).unwrap_or_default(),
            });
        } else {
            tracing::debug!(peer = %name, "peer has no new changes");
        }

        Ok(CycleOutcome::Applied { applied, watermark })
    }

    /// Replay one record; puts carry the peer's current value
    async fn apply<P: ReplicationPeer>(&self, peer: &P, name: &str, record: &ChangeRecord) -> ReplicationResult<()> {
        let op = match record.change_type {
            ChangeType::Put => match peer.fetch(&record.key).await {
                Ok(value) => WriteOp::put(record.key.clone(), value),
                Err(ReplicationError::NotFound(_)) => WriteOp::delete(record.key.clone()),
                Err(e) => return Err(e),
            },
            ChangeType::Delete => WriteOp::delete(record.key.clone()),
        };
        self.primary.write(op, MutationOrigin::replicated(name))?;
        Ok(())
    }

    /// Run cycles on the configured interval until stopped
    pub fn spawn<P>(self, peer: P) -> DriverHandle
    where
        P: ReplicationPeer + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let peer_name = peer.name().to_string();
        tracing::info!(peer = %peer_name, interval = ?self.config.interval, "replication driver started");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            result = self.run_cycle(&peer) => {
                                if let Err(e) = result {
                                    self.events.error("replicate", &e);
                                }
                            }
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::info!(peer = %peer.name(), "replication driver stopped");
        });

        DriverHandle {
            peer: peer_name,
            shutdown: shutdown_tx,
            task,
        }
    }
}

impl std::fmt::Debug for ReplicationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDriver")
            .field("config", &self.config)
            .field("local_version", &self.local_version)
            .finish()
    }
}

/// Cancellation handle for a spawned driver
#[derive(Debug)]
pub struct DriverHandle {
    peer: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop scheduling and wait for the task to exit
    ///
    /// An in-flight cycle is dropped at its next suspension point.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(peer = %self.peer, "replication driver panicked");
            }
        }
    }
}

/// In-process peer backed by another server's service surface
#[derive(Debug, Clone)]
pub struct LocalPeer {
    name: String,
    service: Arc<ServiceSurface>,
    identity: PeerIdentity,
}

impl LocalPeer {
    pub fn new(name: impl Into<String>, service: Arc<ServiceSurface>) -> Self {
        Self {
            name: name.into(),
            service,
            identity: PeerIdentity::anonymous(),
        }
    }

    /// Identity presented to the remote `access` predicate
    pub fn with_identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = identity;
        self
    }
}

impl ReplicationPeer for LocalPeer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> ReplicationResult<String> {
        self.service.version(&self.identity)
    }

    async fn fetch(&self, key: &str) -> ReplicationResult<Value> {
        self.service.fetch(&self.identity, key)
    }

    async fn changes_since(&self, after: Option<Timestamp>, limit: usize) -> ReplicationResult<Vec<ChangeRecord>> {
        let options = ReadStreamOptions {
            gt: after,
            limit: Some(limit),
        };
        self.service
            .create_read_stream(&self.identity, options)?
            .try_collect()
            .await
    }
}
