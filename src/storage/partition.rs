//! Named key-space partitions inside a single store
//!
//! A partition named `changes` with separator `\u{ff}` owns every key that
//! starts with `\u{ff}changes\u{ff}`. Partitions never overlap as long as no
//! name contains the separator.

use serde_json::Value;

use super::{KeyRange, KvStore, StoreResult};

/// Prefix-scoped view of a key space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    name: String,
    prefix: String,
}

impl Partition {
    pub fn new(name: &str, separator: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: format!("{sep}{name}{sep}", sep = separator, name = name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full store key for a key inside this partition
    pub fn key(&self, local: &str) -> String {
        format!("{}{}", self.prefix, local)
    }

    /// Partition-local part of a store key, if the key belongs here
    pub fn strip<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.prefix.as_str())
    }

    /// Ordered scan of this partition, starting strictly after `after`
    pub fn range_after(&self, after: Option<&str>, limit: usize) -> KeyRange {
        let range = KeyRange::prefix(self.prefix.clone()).with_limit(limit);
        match after {
            Some(local) => range.gt(self.key(local)),
            None => range,
        }
    }

    pub fn get(&self, store: &dyn KvStore, local: &str) -> StoreResult<Option<Value>> {
        store.get(&self.key(local))
    }

    pub fn put(&self, store: &dyn KvStore, local: &str, value: Value) -> StoreResult<()> {
        store.put(&self.key(local), value)
    }

    /// Scan and return partition-local keys
    pub fn scan(&self, store: &dyn KvStore, range: &KeyRange) -> StoreResult<Vec<(String, Value)>> {
        Ok(store
            .range(range)?
            .into_iter()
            .filter_map(|(k, v)| self.strip(&k).map(|local| (local.to_string(), v)))
            .collect())
    }
}
