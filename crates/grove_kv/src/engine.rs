//! Storage engine implementations behind the `StorageEngine` trait.
//!
//! Engines store the latest committed value per key in lexicographic key
//! order. Transactional behavior (read-your-writes, conflict validation,
//! atomic mutations) lives above them in `txn`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::debug;

use crate::error::KvError;

/// A write operation applied atomically as part of a commit batch.
/// `None` clears the key.
pub type WriteOp = (Vec<u8>, Option<Vec<u8>>);

/// Ordered latest-value storage consumed by the transaction layer.
pub trait StorageEngine: Send + Sync + 'static {
    /// Read the current value for `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Scan `[begin, end)` in key order. `limit == 0` means unlimited;
    /// `reverse` returns the same window walked from the top.
    fn scan(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Apply a batch of writes atomically.
    fn apply(&self, batch: &[WriteOp]) -> Result<(), KvError>;

    /// Human label used in the service name.
    fn label(&self) -> String;
}

/// In-memory engine backed by an ordered map. The default for tests and for
/// embedding the layer without durability.
#[derive(Default)]
pub struct MemoryEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| KvError::Engine("engine lock poisoned".into()))?;
        Ok(guard.get(key).cloned())
    }

    fn scan(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| KvError::Engine("engine lock poisoned".into()))?;
        let range = guard.range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)));
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = if reverse {
            range.rev().map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            range.map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), KvError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| KvError::Engine("engine lock poisoned".into()))?;
        for (key, value) in batch {
            match value {
                Some(value) => {
                    guard.insert(key.clone(), value.clone());
                }
                None => {
                    guard.remove(key);
                }
            }
        }
        Ok(())
    }

    fn label(&self) -> String {
        "memory".into()
    }
}

/// Fjall-backed durable engine storing all keys in a single partition.
pub struct FjallEngine {
    keyspace: Keyspace,
    data: PartitionHandle,
}

impl FjallEngine {
    /// Open (or create) the engine at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let keyspace = Config::new(path).open()?;
        let data = keyspace.open_partition("grove_data", PartitionCreateOptions::default())?;
        debug!("opened fjall engine");
        Ok(Self { keyspace, data })
    }
}

impl StorageEngine for FjallEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.get(key)?.map(|slice| slice.to_vec()))
    }

    fn scan(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let iter = self.data.range(begin.to_vec()..end.to_vec());
        let mut out = Vec::new();
        if reverse {
            for item in iter.rev() {
                let (key, value) = item?;
                out.push((key.to_vec(), value.to_vec()));
                if limit > 0 && out.len() == limit {
                    break;
                }
            }
        } else {
            for item in iter {
                let (key, value) = item?;
                out.push((key.to_vec(), value.to_vec()));
                if limit > 0 && out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn apply(&self, batch: &[WriteOp]) -> Result<(), KvError> {
        let mut write = self.keyspace.batch();
        for (key, value) in batch {
            match value {
                Some(value) => write.insert(&self.data, key.clone(), value.clone()),
                None => write.remove(&self.data, key.clone()),
            }
        }
        write.commit()?;
        Ok(())
    }

    fn label(&self) -> String {
        "fjall".into()
    }
}
