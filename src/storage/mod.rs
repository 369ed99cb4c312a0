//! Ordered key-value storage at the replicator's boundary
//!
//! The replicator does not care how a store keeps its data. It needs:
//! - `KvStore`: point reads, tagged writes, ordered range scans, close
//! - `ObservableStore`: a stable subscription point for post-mutation
//!   notifications, used by change capture
//!
//! `Store` is the engine shipped with the crate: an ordered in-memory map,
//! optionally made durable by an append-only JSONL write log.
//!
//! ```text
//! write(op, origin)
//!   ──► append to store.jsonl ──► apply to BTreeMap ──► notify observers
//!                                                        (in write order)
//! ```

mod partition;
mod store;

use std::ops::Bound;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{Mutation, MutationOrigin, WriteOp};

pub use partition::Partition;
pub use store::{Store, StoreConfig};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a storage engine
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,

    #[error("store corrupted: {0}")]
    Corrupted(String),
}

/// Callback invoked after every successful write
///
/// Observers run synchronously inside the write, while the store still
/// serializes writers, so they see mutations in commit order. An observer
/// must not write to the store it is attached to.
pub type MutationObserver = Arc<dyn Fn(&Mutation) + Send + Sync>;

/// Handle returned by [`ObservableStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Ordered scan bounds
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Bound<String>,
    pub end: Bound<String>,
    /// Only keys starting with this prefix are returned
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

impl KeyRange {
    /// Every key in the store
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            prefix: None,
            limit: None,
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            start: Bound::Included(prefix.clone()),
            prefix: Some(prefix),
            ..Self::all()
        }
    }

    pub fn gt(mut self, key: impl Into<String>) -> Self {
        self.start = Bound::Excluded(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<String>) -> Self {
        self.start = Bound::Included(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<String>) -> Self {
        self.end = Bound::Excluded(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<String>) -> Self {
        self.end = Bound::Included(key.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when no key can satisfy the bounds
    pub fn is_empty(&self) -> bool {
        if self.limit == Some(0) {
            return true;
        }
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// Whether a key lies inside the bounds and prefix
    pub fn contains(&self, key: &str) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s.as_str(),
            Bound::Excluded(s) => key > s.as_str(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e.as_str(),
            Bound::Excluded(e) => key < e.as_str(),
            Bound::Unbounded => true,
        };
        let in_prefix = self.prefix.as_deref().map_or(true, |p| key.starts_with(p));
        after_start && before_end && in_prefix
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Minimal ordered key-value store interface
pub trait KvStore: Send + Sync {
    /// Read a key; `Ok(None)` when absent
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Apply a write, tagged with where it came from
    fn write(&self, op: WriteOp, origin: MutationOrigin) -> StoreResult<()>;

    /// Local put
    fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        self.write(WriteOp::put(key, value), MutationOrigin::Local)
    }

    /// Local delete; deleting an absent key still counts as a mutation
    fn delete(&self, key: &str) -> StoreResult<()> {
        self.write(WriteOp::delete(key), MutationOrigin::Local)
    }

    /// Ordered scan (ascending key order)
    fn range(&self, range: &KeyRange) -> StoreResult<Vec<(String, Value)>>;

    /// Highest entry inside the bounds (limit is ignored)
    fn last(&self, range: &KeyRange) -> StoreResult<Option<(String, Value)>> {
        let unlimited = KeyRange {
            limit: None,
            ..range.clone()
        };
        Ok(self.range(&unlimited)?.pop())
    }

    /// Release resources; idempotent
    fn close(&self) -> StoreResult<()>;

    fn is_closed(&self) -> bool;

    /// Key-space separator the store uses for its own namespacing, if any
    fn separator(&self) -> Option<&str> {
        None
    }
}

/// A store that notifies subscribers after each committed mutation
pub trait ObservableStore: KvStore {
    fn subscribe(&self, observer: MutationObserver) -> SubscriptionId;

    /// Returns false when the id was not subscribed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::prefix("p/").gt("p/b").lte("p/d");

        assert!(!range.contains("p/a"));
        assert!(!range.contains("p/b"));
        assert!(range.contains("p/c"));
        assert!(range.contains("p/d"));
        assert!(!range.contains("p/e"));
        assert!(!range.contains("q/c"));
    }

    #[test]
    fn test_key_range_is_empty() {
        assert!(!KeyRange::all().is_empty());
        assert!(KeyRange::all().gt("b").lt("b").is_empty());
        assert!(KeyRange::all().gte("c").lte("b").is_empty());
        assert!(!KeyRange::all().gte("b").lte("b").is_empty());
        assert!(KeyRange::all().with_limit(0).is_empty());
    }
}
