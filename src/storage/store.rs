//! Store - ordered key-value engine with an append-only write log
//!
//! Every write is appended to `store.jsonl` before it is applied to the
//! in-memory map. On open the log is replayed to rebuild the map; when the
//! log carries many more lines than live keys it is compacted.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    KeyRange, KvStore, MutationObserver, ObservableStore, StoreError, StoreResult, SubscriptionId,
};
use crate::types::{Mutation, MutationOrigin, WriteOp};
use crate::utils::atomic::{discard_stale_temp, replace_file_with};

/// Configuration for a Store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the write log; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Separator the store advertises for namespacing
    pub separator: Option<String>,
    /// fsync after every write instead of only on close and compaction
    pub sync_writes: bool,
    /// Log lines tolerated before compaction is considered
    pub compaction_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            separator: None,
            sync_writes: false,
            compaction_threshold: 10_000,
        }
    }
}

impl StoreConfig {
    /// Durable store rooted at `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_compaction_threshold(mut self, lines: usize) -> Self {
        self.compaction_threshold = lines;
        self
    }

    /// Path to store.jsonl
    pub fn log_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("store.jsonl"))
    }
}

/// One line of the write log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Put { key: String, value: Value },
    Del { key: String },
}

impl LogEntry {
    fn from_op(op: &WriteOp) -> Self {
        match op {
            WriteOp::Put { key, value } => LogEntry::Put {
                key: key.clone(),
                value: value.clone(),
            },
            WriteOp::Delete { key } => LogEntry::Del { key: key.clone() },
        }
    }

    fn apply(self, data: &mut BTreeMap<String, Value>) {
        match self {
            LogEntry::Put { key, value } => {
                data.insert(key, value);
            }
            LogEntry::Del { key } => {
                data.remove(&key);
            }
        }
    }
}

struct StoreInner {
    data: BTreeMap<String, Value>,
    log: Option<BufWriter<File>>,
    /// Lines currently in the write log
    log_lines: usize,
}

/// Ordered, observable key-value store
pub struct Store {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    observers: RwLock<Vec<(SubscriptionId, MutationObserver)>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
}

impl Store {
    /// Volatile store with no write log
    pub fn in_memory() -> Self {
        Self::from_parts(StoreConfig::default(), BTreeMap::new(), None, 0)
    }

    /// Open (or create) a durable store in `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> StoreResult<Self> {
        Self::open_with(StoreConfig::new(data_dir))
    }

    /// Open a store with explicit configuration
    pub fn open_with(config: StoreConfig) -> StoreResult<Self> {
        let log_path = match config.log_path() {
            Some(path) => path,
            None => return Ok(Self::from_parts(config, BTreeMap::new(), None, 0)),
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if discard_stale_temp(&log_path)? {
            tracing::warn!(path = %log_path.display(), "discarded interrupted compaction");
        }

        let (data, mut log_lines) = Self::replay(&log_path)?;

        if log_lines > config.compaction_threshold && log_lines > data.len() * 2 {
            Self::rewrite_log(&log_path, &data)?;
            tracing::info!(
                path = %log_path.display(),
                before = log_lines,
                after = data.len(),
                "compacted write log"
            );
            log_lines = data.len();
        }

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        tracing::debug!(path = %log_path.display(), keys = data.len(), "store opened");

        Ok(Self::from_parts(
            config,
            data,
            Some(BufWriter::new(file)),
            log_lines,
        ))
    }

    fn from_parts(
        config: StoreConfig,
        data: BTreeMap<String, Value>,
        log: Option<BufWriter<File>>,
        log_lines: usize,
    ) -> Self {
        Self {
            config,
            inner: RwLock::new(StoreInner {
                data,
                log,
                log_lines,
            }),
            observers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Rebuild the map from the write log
    fn replay(log_path: &Path) -> StoreResult<(BTreeMap<String, Value>, usize)> {
        let mut data = BTreeMap::new();
        if !log_path.exists() {
            return Ok((data, 0));
        }

        let reader = BufReader::new(File::open(log_path)?);
        let mut lines = 0;

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => {
                    entry.apply(&mut data);
                    lines += 1;
                }
                Err(e) => {
                    // A torn final line is expected after a crash
                    tracing::warn!(
                        path = %log_path.display(),
                        line = line_num + 1,
                        error = %e,
                        "skipping unreadable log line"
                    );
                }
            }
        }

        Ok((data, lines))
    }

    fn rewrite_log(log_path: &Path, data: &BTreeMap<String, Value>) -> StoreResult<()> {
        replace_file_with(log_path, |writer| {
            for (key, value) in data {
                let entry = LogEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                };
                let line = serde_json::to_string(&entry).map_err(std::io::Error::from)?;
                writeln!(writer, "{}", line)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Rewrite the write log to hold only live keys
    pub fn compact(&self) -> StoreResult<()> {
        let log_path = match self.config.log_path() {
            Some(path) => path,
            None => return Ok(()),
        };

        let mut inner = self.inner.write();
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        if let Some(log) = inner.log.as_mut() {
            log.flush()?;
        }
        Self::rewrite_log(&log_path, &inner.data)?;

        let file = OpenOptions::new().append(true).open(&log_path)?;
        inner.log = Some(BufWriter::new(file));
        inner.log_lines = inner.data.len();
        Ok(())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines currently in the write log (0 for in-memory stores)
    pub fn log_lines(&self) -> usize {
        self.inner.read().log_lines
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn notify(&self, mutation: &Mutation) {
        for (_, observer) in self.observers.read().iter() {
            observer(mutation);
        }
    }
}

impl KvStore for Store {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let inner = self.inner.read();
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(inner.data.get(key).cloned())
    }

    fn write(&self, op: WriteOp, origin: MutationOrigin) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        if let Some(log) = inner.log.as_mut() {
            let line = serde_json::to_string(&LogEntry::from_op(&op))?;
            writeln!(log, "{}", line)?;
            log.flush()?;
            if self.config.sync_writes {
                log.get_ref().sync_data()?;
            }
            inner.log_lines += 1;
        }

        let mutation = Mutation::from_op(&op, origin);
        match op {
            WriteOp::Put { key, value } => {
                inner.data.insert(key, value);
            }
            WriteOp::Delete { key } => {
                inner.data.remove(&key);
            }
        }

        // Still holding the write lock: observers see commit order
        self.notify(&mutation);
        Ok(())
    }

    fn range(&self, range: &KeyRange) -> StoreResult<Vec<(String, Value)>> {
        let inner = self.inner.read();
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let limit = range.limit.unwrap_or(usize::MAX);
        let prefix = range.prefix.as_deref();

        Ok(inner
            .data
            .range::<str, _>(borrowed_bounds(range))
            .skip_while(|(k, _)| prefix.map_or(false, |p| k.as_str() < p))
            .take_while(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last(&self, range: &KeyRange) -> StoreResult<Option<(String, Value)>> {
        let inner = self.inner.read();
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if range.is_empty() {
            return Ok(None);
        }

        let prefix = range.prefix.as_deref();

        Ok(inner
            .data
            .range::<str, _>(borrowed_bounds(range))
            .rev()
            .skip_while(|(k, _)| prefix.map_or(false, |p| !k.starts_with(p) && k.as_str() > p))
            .take_while(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.observers.write().clear();

        if let Some(mut log) = inner.log.take() {
            log.flush()?;
            log.get_ref().sync_all()?;
        }
        tracing::debug!(keys = inner.data.len(), "store closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn separator(&self) -> Option<&str> {
        self.config.separator.as_deref()
    }
}

fn borrow_bound(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_str()),
        Bound::Excluded(key) => Bound::Excluded(key.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn borrowed_bounds(range: &KeyRange) -> (Bound<&str>, Bound<&str>) {
    (borrow_bound(&range.start), borrow_bound(&range.end))
}

impl ObservableStore for Store {
    fn subscribe(&self, observer: MutationObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.observers.write().push((id, observer));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeType;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let store = Store::in_memory();

        store.put("a", json!(1)).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!(1)));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_range_is_ordered_and_bounded() {
        let store = Store::in_memory();
        for key in ["b", "a", "d", "c", "e"] {
            store.put(key, json!(key)).unwrap();
        }

        let keys: Vec<String> = store
            .range(&KeyRange::all().gt("a").lt("e").with_limit(2))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_prefix_range() {
        let store = Store::in_memory();
        store.put("x/1", json!(1)).unwrap();
        store.put("y/1", json!(2)).unwrap();
        store.put("y/2", json!(3)).unwrap();
        store.put("z/1", json!(4)).unwrap();

        let rows = store.range(&KeyRange::prefix("y/")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "y/1");
        assert_eq!(rows[1].0, "y/2");
    }

    #[test]
    fn test_last_within_prefix() {
        let store = Store::in_memory();
        store.put("a/1", json!(1)).unwrap();
        store.put("a/2", json!(2)).unwrap();
        store.put("b/1", json!(3)).unwrap();

        let last = store.last(&KeyRange::prefix("a/")).unwrap();
        assert_eq!(last, Some(("a/2".to_string(), json!(2))));
        assert_eq!(store.last(&KeyRange::prefix("c/")).unwrap(), None);
    }

    #[test]
    fn test_inverted_range_is_empty_not_panic() {
        let store = Store::in_memory();
        store.put("a", json!(1)).unwrap();
        assert!(store.range(&KeyRange::all().gt("b").lt("a")).unwrap().is_empty());
    }

    #[test]
    fn test_observers_see_writes_in_order() {
        let store = Store::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(Arc::new(move |m: &Mutation| {
            sink.lock().push((m.change_type, m.key.clone(), m.origin.clone()))
        }));

        store.put("a", json!(1)).unwrap();
        store
            .write(WriteOp::delete("a"), MutationOrigin::replicated("peer-1"))
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (ChangeType::Put, "a".to_string(), MutationOrigin::Local));
        assert_eq!(
            seen[1],
            (
                ChangeType::Delete,
                "a".to_string(),
                MutationOrigin::replicated("peer-1")
            )
        );
    }

    #[test]
    fn test_unsubscribe() {
        let store = Store::in_memory();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let id = store.subscribe(Arc::new(move |_: &Mutation| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.put("a", json!(1)).unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.put("b", json!(2)).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_durable_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = Store::open(temp_dir.path()).unwrap();
            store.put("a", json!({"n": 1})).unwrap();
            store.put("b", json!("two")).unwrap();
            store.delete("a").unwrap();
            store.close().unwrap();
        }

        let store = Store::open(temp_dir.path()).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(json!("two")));
        assert_eq!(store.log_lines(), 3);
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = Store::open(temp_dir.path()).unwrap();
            store.put("a", json!(1)).unwrap();
            store.close().unwrap();
        }
        let log = temp_dir.path().join("store.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, "{{\"op\":\"put\",\"key\":\"b\"").unwrap();
        drop(file);

        let store = Store::open(temp_dir.path()).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!(1)));
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_compaction_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::new(temp_dir.path()).with_compaction_threshold(10);
        {
            let store = Store::open_with(config.clone()).unwrap();
            for i in 0..50 {
                store.put("hot", json!(i)).unwrap();
            }
            store.close().unwrap();
        }

        let store = Store::open_with(config).unwrap();
        assert_eq!(store.log_lines(), 1);
        assert_eq!(store.get("hot").unwrap(), Some(json!(49)));
    }

    #[test]
    fn test_explicit_compact_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path()).unwrap();
        store.put("a", json!(1)).unwrap();
        store.put("a", json!(2)).unwrap();
        store.put("b", json!(3)).unwrap();

        store.compact().unwrap();
        assert_eq!(store.log_lines(), 2);

        store.put("c", json!(4)).unwrap();
        store.close().unwrap();

        let reopened = Store::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get("a").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = Store::in_memory();
        store.close().unwrap();
        store.close().unwrap();

        assert!(store.is_closed());
        assert!(matches!(store.get("a"), Err(StoreError::Closed)));
        assert!(matches!(store.put("a", json!(1)), Err(StoreError::Closed)));
        assert!(matches!(store.range(&KeyRange::all()), Err(StoreError::Closed)));
    }
}
