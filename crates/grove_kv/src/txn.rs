//! Optimistically-validated transactions over a `StorageEngine`.
//!
//! A `Database` wraps an engine with commit bookkeeping: a monotonic commit
//! version and a per-key last-modified map. Transactions buffer their writes
//! locally (read-your-writes), record the keys and ranges they read, and
//! validate at commit that nothing in the read set was committed by another
//! transaction after this one's read version. Validation failure surfaces as
//! `KvError::NotCommitted`, which outer retry loops treat as retryable.
//!
//! Snapshot reads (`snapshot_get`, the snapshot range variants) skip read-set
//! registration and therefore never contribute conflicts.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::engine::{StorageEngine, WriteOp};
use crate::error::KvError;
use crate::tuple::strinc;

const RUN_RETRY_LIMIT: usize = 10;

/// One decoded key/value pair returned by range reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Resolvable range boundary: the first key `>=` (or `>`) a reference key.
#[derive(Debug, Clone)]
pub struct KeySelector {
    key: Vec<u8>,
    or_equal: bool,
}

impl KeySelector {
    pub fn first_greater_or_equal(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            or_equal: true,
        }
    }

    pub fn first_greater_than(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            or_equal: false,
        }
    }

    // Both begin and end selectors reduce to a plain byte bound: the smallest
    // key a selector can resolve to is `key` itself for >=, and `key ++ 0x00`
    // for >.
    fn bound_bytes(&self) -> Vec<u8> {
        if self.or_equal {
            self.key.clone()
        } else {
            let mut out = self.key.clone();
            out.push(0x00);
            out
        }
    }
}

struct CommitState {
    version: u64,
    last_modified: BTreeMap<Vec<u8>, u64>,
}

struct Shared {
    engine: Arc<dyn StorageEngine>,
    state: Mutex<CommitState>,
}

/// Handle to an engine plus the commit bookkeeping shared by its transactions.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                state: Mutex::new(CommitState {
                    version: 0,
                    last_modified: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Begin a new transaction at the current commit version.
    pub fn create_transaction(&self) -> Transaction {
        let read_version = self.current_version();
        Transaction {
            shared: self.shared.clone(),
            inner: Mutex::new(TxnInner::fresh(read_version)),
        }
    }

    /// Run `body` in its own transaction, committing on success and retrying
    /// on retryable failures up to an internal attempt limit.
    pub fn run<T>(
        &self,
        body: impl Fn(&Transaction) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let mut last = KvError::NotCommitted;
        for _ in 0..RUN_RETRY_LIMIT {
            let txn = self.create_transaction();
            match body(&txn).and_then(|out| txn.commit().map(|_| out)) {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    pub fn engine_label(&self) -> String {
        self.shared.engine.label()
    }

    fn current_version(&self) -> u64 {
        self.shared
            .state
            .lock()
            .map(|state| state.version)
            .unwrap_or(0)
    }
}

struct TxnInner {
    read_version: u64,
    start_time: Instant,
    committed: bool,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    adds: BTreeMap<Vec<u8>, i64>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    read_keys: Vec<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TxnInner {
    fn fresh(read_version: u64) -> Self {
        Self {
            read_version,
            start_time: Instant::now(),
            committed: false,
            writes: BTreeMap::new(),
            adds: BTreeMap::new(),
            cleared_ranges: Vec::new(),
            read_keys: Vec::new(),
            read_ranges: Vec::new(),
        }
    }

    fn is_cleared(&self, key: &[u8]) -> bool {
        self.cleared_ranges
            .iter()
            .any(|(begin, end)| key >= begin.as_slice() && key < end.as_slice())
    }
}

/// A single read-your-writes transaction. Interior mutability keeps the whole
/// surface `&self` so iterators can coexist with writes and commits.
pub struct Transaction {
    shared: Arc<Shared>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    /// Read a key, registering it in the read-conflict set.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.read_value(key, true)
    }

    /// Read a key without registering a conflict.
    pub fn snapshot_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.read_value(key, false)
    }

    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        let key = key.into();
        inner.adds.remove(&key);
        inner.writes.insert(key, Some(value.into()));
    }

    pub fn clear(&self, key: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        let key = key.into();
        inner.adds.remove(&key);
        inner.writes.insert(key, None);
    }

    /// Clear every key in `[begin, end)`.
    pub fn clear_range(&self, begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        let begin = begin.into();
        let end = end.into();
        let doomed: Vec<Vec<u8>> = inner
            .writes
            .range(begin.clone()..end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.writes.remove(&key);
            inner.adds.remove(&key);
        }
        let pending_adds: Vec<Vec<u8>> = inner
            .adds
            .range(begin.clone()..end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in pending_adds {
            inner.adds.remove(&key);
        }
        inner.cleared_ranges.push((begin, end));
    }

    /// Clear every key starting with `prefix`.
    pub fn clear_prefix(&self, prefix: &[u8]) -> Result<(), KvError> {
        let end = strinc(prefix)?;
        self.clear_range(prefix.to_vec(), end);
        Ok(())
    }

    /// Atomic ADD of a signed little-endian 64-bit delta. Applied at commit
    /// against the then-current value without registering a read conflict.
    pub fn add(&self, key: impl Into<Vec<u8>>, delta: i64) {
        let mut inner = self.lock();
        let key = key.into();
        match inner.writes.get(&key).cloned() {
            // A locally-written value folds immediately.
            Some(existing) => {
                let current = decode_le(existing.as_deref());
                inner
                    .writes
                    .insert(key, Some(encode_le(current.wrapping_add(delta)).to_vec()));
            }
            None => {
                *inner.adds.entry(key).or_insert(0) += delta;
            }
        }
    }

    /// Resolve the selectors and read the window, registering a range
    /// conflict over the resolved bounds.
    pub fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<KeyValue>, KvError> {
        self.read_range(&begin.bound_bytes(), &end.bound_bytes(), limit, reverse, true)
    }

    /// Range read without conflict registration.
    pub fn snapshot_get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<KeyValue>, KvError> {
        self.read_range(&begin.bound_bytes(), &end.bound_bytes(), limit, reverse, false)
    }

    /// Lazy paged iterator over `[begin, end)`.
    pub fn range_iterator(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: usize,
        reverse: bool,
    ) -> RangeIterator<'_> {
        RangeIterator {
            txn: self,
            begin: begin.bound_bytes(),
            end: end.bound_bytes(),
            reverse,
            page: VecDeque::new(),
            page_size: RANGE_PAGE_SIZE,
            remaining: if limit == 0 { usize::MAX } else { limit },
            exhausted: false,
        }
    }

    /// Validate the read set against concurrent commits and apply buffered
    /// writes atomically. Fails with `NotCommitted` when another transaction
    /// committed an intersecting write after this transaction began.
    pub fn commit(&self) -> Result<(), KvError> {
        let mut inner = self.lock();
        if inner.committed {
            return Err(KvError::UsedAfterCommit);
        }
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| KvError::Engine("commit state lock poisoned".into()))?;

        for key in &inner.read_keys {
            if let Some(version) = state.last_modified.get(key) {
                if *version > inner.read_version {
                    return Err(KvError::NotCommitted);
                }
            }
        }
        for (begin, end) in &inner.read_ranges {
            let conflicting = state
                .last_modified
                .range(begin.clone()..end.clone())
                .any(|(_, version)| *version > inner.read_version);
            if conflicting {
                return Err(KvError::NotCommitted);
            }
        }

        state.version += 1;
        let version = state.version;
        let mut ops: Vec<WriteOp> = Vec::new();
        for (begin, end) in &inner.cleared_ranges {
            for (key, _) in self.shared.engine.scan(begin, end, 0, false)? {
                state.last_modified.insert(key.clone(), version);
                ops.push((key, None));
            }
        }
        for (key, value) in &inner.writes {
            state.last_modified.insert(key.clone(), version);
            ops.push((key.clone(), value.clone()));
        }
        for (key, delta) in &inner.adds {
            let current = decode_le(self.shared.engine.get(key)?.as_deref());
            state.last_modified.insert(key.clone(), version);
            ops.push((key.clone(), Some(encode_le(current.wrapping_add(*delta)).to_vec())));
        }
        self.shared.engine.apply(&ops)?;
        inner.committed = true;
        Ok(())
    }

    /// Abandon all pending work and begin again at a fresh read version.
    pub fn reset(&self) {
        let read_version = self
            .shared
            .state
            .lock()
            .map(|state| state.version)
            .unwrap_or(0);
        *self.lock() = TxnInner::fresh(read_version);
    }

    /// Wall-clock instant at which the transaction (last) began.
    pub fn start_time(&self) -> Instant {
        self.lock().start_time
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxnInner> {
        // A poisoned transaction lock means a panic mid-operation; propagating
        // the inner state is still sound for cleanup paths.
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn read_value(&self, key: &[u8], record: bool) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.lock();
        if inner.committed {
            return Err(KvError::UsedAfterCommit);
        }
        if record {
            inner.read_keys.push(key.to_vec());
        }
        if let Some(local) = inner.writes.get(key) {
            return Ok(local.clone());
        }
        let base = if inner.is_cleared(key) {
            None
        } else {
            self.shared.engine.get(key)?
        };
        if let Some(delta) = inner.adds.get(key) {
            let current = decode_le(base.as_deref());
            return Ok(Some(encode_le(current.wrapping_add(*delta)).to_vec()));
        }
        Ok(base)
    }

    fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
        record: bool,
    ) -> Result<Vec<KeyValue>, KvError> {
        let mut inner = self.lock();
        if inner.committed {
            return Err(KvError::UsedAfterCommit);
        }
        if begin >= end {
            return Ok(Vec::new());
        }
        if record {
            inner.read_ranges.push((begin.to_vec(), end.to_vec()));
        }

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, value) in self.shared.engine.scan(begin, end, 0, false)? {
            if !inner.is_cleared(&key) {
                merged.insert(key, value);
            }
        }
        for (key, value) in inner.writes.range(begin.to_vec()..end.to_vec()) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        for (key, delta) in inner.adds.range(begin.to_vec()..end.to_vec()) {
            let current = decode_le(merged.get(key).map(|v| v.as_slice()));
            merged.insert(key.clone(), encode_le(current.wrapping_add(*delta)).to_vec());
        }

        let mut out: Vec<KeyValue> = if reverse {
            merged
                .into_iter()
                .rev()
                .map(|(key, value)| KeyValue { key, value })
                .collect()
        } else {
            merged
                .into_iter()
                .map(|(key, value)| KeyValue { key, value })
                .collect()
        };
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

const RANGE_PAGE_SIZE: usize = 256;

/// Paged iterator whose resume point after each page is strictly beyond the
/// last yielded key, so pages never overlap.
pub struct RangeIterator<'a> {
    txn: &'a Transaction,
    begin: Vec<u8>,
    end: Vec<u8>,
    reverse: bool,
    page: VecDeque<KeyValue>,
    page_size: usize,
    remaining: usize,
    exhausted: bool,
}

impl<'a> Iterator for RangeIterator<'a> {
    type Item = Result<KeyValue, KvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.page.is_empty() {
            if self.exhausted {
                return None;
            }
            let window = self.page_size.min(self.remaining);
            let page = match self
                .txn
                .read_range(&self.begin, &self.end, window, self.reverse, true)
            {
                Ok(page) => page,
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            };
            if page.len() < window {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                if self.reverse {
                    // Shrink the window from the top; the last yielded key
                    // becomes the next exclusive end.
                    self.end = last.key.clone();
                } else {
                    let mut next = last.key.clone();
                    next.push(0x00);
                    self.begin = next;
                }
            }
            self.page = page.into();
            if self.page.is_empty() {
                return None;
            }
        }
        let kv = self.page.pop_front()?;
        self.remaining -= 1;
        Some(Ok(kv))
    }
}

fn decode_le(value: Option<&[u8]>) -> i64 {
    let mut buf = [0u8; 8];
    if let Some(value) = value {
        let len = value.len().min(8);
        buf[..len].copy_from_slice(&value[..len]);
    }
    i64::from_le_bytes(buf)
}

fn encode_le(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}
