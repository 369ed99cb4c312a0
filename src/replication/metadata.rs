//! Replication metadata: change log, version marker, watermarks
//!
//! All three live in one dedicated store, separated into partitions:
//!
//! ```text
//! {sep}changes{sep}00001704067200000000   -> {"timestamp":..,"type":"put","key":"a"}
//! {sep}meta{sep}version                   -> "1.3.0"
//! {sep}watermarks{sep}<peer>              -> 1704067200000000
//! ```

use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::compat;
use crate::error::{ReplicationError, ReplicationResult};
use crate::storage::{KvStore, Partition, Store, StoreConfig};
use crate::types::{ChangeRecord, ChangeType, Timestamp};
use crate::utils::MonotonicClock;

/// Separator used when neither the config nor the primary store provides one
pub const DEFAULT_SEPARATOR: &str = "\u{ff}";

/// Records fetched per page while streaming the change log
pub const STREAM_PAGE_SIZE: usize = 256;

const VERSION_KEY: &str = "version";

/// Options accepted by [`ReplicationMetadataStore::changes`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStreamOptions {
    /// Only records strictly after this timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Timestamp>,

    /// Stop after this many records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ReadStreamOptions {
    pub fn after(timestamp: Timestamp) -> Self {
        Self {
            gt: Some(timestamp),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Namespaced replication state on top of a dedicated store
pub struct ReplicationMetadataStore {
    store: Arc<dyn KvStore>,
    changes: Partition,
    meta: Partition,
    watermarks: Partition,
    clock: MonotonicClock,
    /// Single serialization point for timestamp assignment and append
    append_lock: Mutex<()>,
}

impl ReplicationMetadataStore {
    /// Wrap an existing store; the clock resumes after the newest record
    pub fn new(store: Arc<dyn KvStore>, separator: &str) -> ReplicationResult<Self> {
        if separator.is_empty() {
            return Err(ReplicationError::Config(
                "key separator must not be empty".to_string(),
            ));
        }

        let changes = Partition::new("changes", separator);
        let latest = store
            .last(&changes.range_after(None, 1))?
            .and_then(|(key, _)| changes.strip(&key).and_then(Timestamp::from_key));

        let clock = MonotonicClock::new();
        if let Some(latest) = latest {
            clock.observe(latest);
        }

        Ok(Self {
            store,
            changes,
            meta: Partition::new("meta", separator),
            watermarks: Partition::new("watermarks", separator),
            clock,
            append_lock: Mutex::new(()),
        })
    }

    /// Durable metadata store in `dir`
    pub fn open<P: AsRef<Path>>(dir: P, separator: &str) -> ReplicationResult<Self> {
        let store = Store::open_with(StoreConfig::new(dir).with_separator(separator))?;
        Self::new(Arc::new(store), separator)
    }

    /// Volatile metadata store
    pub fn in_memory(separator: &str) -> ReplicationResult<Self> {
        Self::new(Arc::new(Store::in_memory()), separator)
    }

    /// Append a change record with a fresh timestamp
    ///
    /// Concurrent callers are serialized, so append order equals timestamp
    /// order.
    pub fn append_change(&self, change_type: ChangeType, key: &str) -> ReplicationResult<ChangeRecord> {
        let _guard = self.append_lock.lock();
        let record = ChangeRecord::new(self.clock.next(), change_type, key);
        self.changes.put(
            self.store.as_ref(),
            &record.timestamp.to_key(),
            serde_json::to_value(&record)?,
        )?;
        Ok(record)
    }

    /// One page of change records after `after`
    pub fn changes_page(&self, after: Option<Timestamp>, limit: usize) -> ReplicationResult<Vec<ChangeRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cursor = after.map(|ts| ts.to_key());
        let range = self.changes.range_after(cursor.as_deref(), limit);

        self.changes
            .scan(self.store.as_ref(), &range)?
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(ReplicationError::from))
            .collect()
    }

    /// Lazy ascending stream over the change log
    ///
    /// Pages are read on demand until a page comes back empty, so records
    /// appended while the stream is consumed are included. Each call starts
    /// a fresh stream.
    pub fn changes(
        self: &Arc<Self>,
        options: ReadStreamOptions,
    ) -> impl Stream<Item = ReplicationResult<ChangeRecord>> + Send + 'static {
        let this = Arc::clone(self);
        async_stream::try_stream! {
            let mut cursor = options.gt;
            let mut remaining = options.limit.unwrap_or(usize::MAX);

            while remaining > 0 {
                let page = this.changes_page(cursor, remaining.min(STREAM_PAGE_SIZE))?;
                if page.is_empty() {
                    break;
                }
                for record in page {
                    cursor = Some(record.timestamp);
                    remaining -= 1;
                    yield record;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    /// Newest change record
    pub fn latest_change(&self) -> ReplicationResult<Option<ChangeRecord>> {
        match self.store.last(&self.changes.range_after(None, 1))? {
            Some((_, value)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store the running version; an existing newer marker is kept
    ///
    /// Returns the marker in effect afterwards.
    pub fn write_version(&self, version: &str) -> ReplicationResult<String> {
        if let Some(current) = self.version()? {
            if !compat::is_not_older(version, &current) {
                tracing::warn!(
                    stored = %current,
                    running = version,
                    "keeping newer version marker"
                );
                return Ok(current);
            }
        }
        self.meta
            .put(self.store.as_ref(), VERSION_KEY, Value::String(version.to_string()))?;
        Ok(version.to_string())
    }

    /// Read the version marker
    pub fn version(&self) -> ReplicationResult<Option<String>> {
        match self.meta.get(self.store.as_ref(), VERSION_KEY)? {
            Some(Value::String(version)) => Ok(Some(version)),
            Some(other) => Err(ReplicationError::Protocol(format!(
                "version marker is not a string: {}",
                other
            ))),
            None => Ok(None),
        }
    }

    /// Last change applied from `peer`
    pub fn watermark(&self, peer: &str) -> ReplicationResult<Option<Timestamp>> {
        match self.watermarks.get(self.store.as_ref(), peer)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn set_watermark(&self, peer: &str, timestamp: Timestamp) -> ReplicationResult<()> {
        self.watermarks
            .put(self.store.as_ref(), peer, serde_json::to_value(timestamp)?)?;
        Ok(())
    }

    /// Close the underlying store; idempotent
    pub fn close(&self) -> ReplicationResult<()> {
        self.store.close()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// Last timestamp issued (or recovered from disk)
    pub fn last_timestamp(&self) -> Timestamp {
        self.clock.last()
    }
}

impl std::fmt::Debug for ReplicationMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationMetadataStore")
            .field("changes", &self.changes.prefix())
            .field("last_timestamp", &self.clock.last())
            .field("closed", &self.is_closed())
            .finish()
    }
}
