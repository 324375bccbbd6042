//! The storage adapter service.
//!
//! `GroveStore` binds the KV substrate, the directory layer, metrics, and the
//! process-wide caches together, and exposes the single-row, group-scan, and
//! index-scan surface the query layer drives. Directory usage under the
//! configured root:
//!
//! ```text
//! data/          one subpath per group/table/index/sequence
//! dataAltering/  staging area while an alter is in flight
//! indexCount/    8-byte little-endian signed row count per group index
//! indexNull/     Tuple(long) null-separator counter per nullable-unique index
//! ```
//!
//! Count and null-separator cells key themselves by appending the owning
//! index's data prefix onto the cached directory prefix.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

use grove_kv::{Database, DirectoryLayer, KeySelector, KeyValue, RangeIterator};
use tracing::{debug, warn};

use crate::codec;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::index::IndexRow;
use crate::key::{Edge, HKey, Key};
use crate::metrics::StoreMetrics;
use crate::row::RowData;
use crate::schema::{GroupDef, IndexDef, SequenceDef, StorageDescription, TableDef};
use crate::sequence::SequenceCache;
use crate::session::Session;

const INDEX_COUNT_DIR: &str = "indexCount";
const INDEX_NULL_DIR: &str = "indexNull";

/// Scratch state for one single-row operation: the owning object, the key
/// being addressed, and the value read or about to be written.
#[derive(Debug, Clone)]
pub struct StoreData {
    pub desc: StorageDescription,
    pub key: Key,
    pub value: Option<Vec<u8>>,
}

impl StoreData {
    pub fn new(desc: StorageDescription) -> Self {
        Self {
            desc,
            key: Key::new(),
            value: None,
        }
    }
}

/// The storage adapter service.
pub struct GroveStore {
    db: Database,
    dirs: DirectoryLayer,
    config: StoreConfig,
    metrics: StoreMetrics,
    packed_index_count_prefix: OnceLock<Vec<u8>>,
    packed_index_null_prefix: OnceLock<Vec<u8>>,
    pub(crate) sequence_caches: RwLock<HashMap<Vec<u8>, std::sync::Arc<Mutex<SequenceCache>>>>,
    pub(crate) index_row_pool: Mutex<Vec<IndexRow>>,
}

impl GroveStore {
    pub fn new(db: Database, config: StoreConfig) -> Self {
        Self {
            db,
            dirs: DirectoryLayer::new(),
            config,
            metrics: StoreMetrics::new(),
            packed_index_count_prefix: OnceLock::new(),
            packed_index_null_prefix: OnceLock::new(),
            sequence_caches: RwLock::new(HashMap::new()),
            index_row_pool: Mutex::new(Vec::new()),
        }
    }

    //
    // Service
    //

    /// Resolve (creating if needed) the `indexCount` and `indexNull`
    /// directories and cache their packed prefixes. Must run before any
    /// group-index count or nullable-unique index operation.
    pub fn start(&self) -> Result<(), StoreError> {
        let count_prefix = self
            .db
            .run(|txn| self.dirs.create_or_open(txn, &[INDEX_COUNT_DIR]))?;
        let null_prefix = self
            .db
            .run(|txn| self.dirs.create_or_open(txn, &[INDEX_NULL_DIR]))?;
        let _ = self.packed_index_count_prefix.set(count_prefix);
        let _ = self.packed_index_null_prefix.set(null_prefix);
        debug!(name = %self.name(), "storage layer started");
        Ok(())
    }

    /// All state is in the KV store; nothing to flush.
    pub fn stop(&self) {}

    /// Crash-stop is indistinguishable from stop.
    pub fn crash(&self) {}

    pub fn name(&self) -> String {
        format!(
            "Grove storage layer v{} on {}",
            env!("CARGO_PKG_VERSION"),
            self.db.engine_label()
        )
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn directory(&self) -> &DirectoryLayer {
        &self.dirs
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn create_session(&self) -> Session {
        Session::new(&self.db)
    }

    /// Resolve a storage description for `path`, allocating a prefix on first
    /// use.
    pub fn resolve_storage(
        &self,
        session: &Session,
        path: &[&str],
    ) -> Result<StorageDescription, StoreError> {
        let prefix = self.dirs.create_or_open(session.txn(), path)?;
        Ok(StorageDescription::new(
            path.iter().map(|s| (*s).to_string()).collect(),
            prefix,
        ))
    }

    //
    // Single-row operations
    //

    /// Write `data.value` at the packed key. Uniqueness is not checked here;
    /// that is the index writer's concern.
    pub fn store(&self, session: &Session, data: &StoreData) -> Result<(), StoreError> {
        let value = data
            .value
            .as_ref()
            .ok_or_else(|| StoreError::Internal("store called without a value".into()))?;
        let packed = codec::pack(&data.desc, &data.key);
        session.txn().set(packed, value.clone());
        self.metrics.record_store();
        Ok(())
    }

    /// Read the row at the packed key into `data.value`; reports whether the
    /// key existed.
    pub fn fetch(&self, session: &Session, data: &mut StoreData) -> Result<bool, StoreError> {
        let packed = codec::pack(&data.desc, &data.key);
        data.value = session.txn().get(&packed)?;
        self.metrics.record_fetch();
        Ok(data.value.is_some())
    }

    /// Delete the row at the packed key; reports whether it existed. The
    /// existence probe is an extra point read until the underlying store can
    /// answer it from the clear itself.
    pub fn clear(&self, session: &Session, data: &StoreData) -> Result<bool, StoreError> {
        let packed = codec::pack(&data.desc, &data.key);
        let existed = session.txn().get(&packed)?.is_some();
        session.txn().clear(packed);
        self.metrics.record_clear();
        Ok(existed)
    }

    /// Iterate the proper descendants of `data.key`, decoding each KV back
    /// into a `(Key, value)` pair. Read-only.
    pub fn descendant_iterator<'s>(
        &self,
        session: &'s Session,
        data: &StoreData,
    ) -> DescendantIterator<'s> {
        let begin = codec::pack_edge(&data.desc, &data.key, Edge::Before);
        let end = codec::pack_edge(&data.desc, &data.key, Edge::After);
        DescendantIterator {
            desc: data.desc.clone(),
            inner: session.txn().range_iterator(
                &KeySelector::first_greater_or_equal(begin),
                &KeySelector::first_greater_or_equal(end),
                0,
                false,
            ),
        }
    }

    /// Whether any row exists under the object's prefix.
    pub fn tree_exists(
        &self,
        session: &Session,
        desc: &StorageDescription,
    ) -> Result<bool, StoreError> {
        let begin = desc.prefix().to_vec();
        let end = codec::prefix_end(desc)?;
        let rows = session.txn().get_range(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            1,
            false,
        )?;
        Ok(!rows.is_empty())
    }

    /// Clear every key under the object's prefix.
    pub fn truncate_tree(
        &self,
        session: &Session,
        desc: &StorageDescription,
    ) -> Result<(), StoreError> {
        session.txn().clear_prefix(desc.prefix())?;
        Ok(())
    }

    /// Truncate, and for group indexes drop the count cell too.
    pub fn remove_tree(&self, session: &Session, index: &IndexDef) -> Result<(), StoreError> {
        self.truncate_tree(session, &index.storage)?;
        if index.is_group_index() {
            session.txn().clear(self.group_index_count_key(index)?);
        }
        Ok(())
    }

    //
    // Group iterators
    //

    /// Full group scan in ascending hkey order.
    pub fn group_iterator<'s>(
        &self,
        session: &'s Session,
        group: &GroupDef,
    ) -> Result<RangeIterator<'s>, StoreError> {
        let begin = group.storage.prefix().to_vec();
        let end = codec::prefix_end(&group.storage)?;
        Ok(session.txn().range_iterator(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            0,
            false,
        ))
    }

    /// Subtree scan: the row at `hkey` plus all of its descendants.
    pub fn group_iterator_at<'s>(
        &self,
        session: &'s Session,
        group: &GroupDef,
        hkey: &HKey,
    ) -> RangeIterator<'s> {
        let begin = codec::pack(&group.storage, hkey.key());
        let end = codec::pack_edge(&group.storage, hkey.key(), Edge::After);
        session.txn().range_iterator(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            0,
            false,
        )
    }

    /// One page of a resumable group scan. The next page begins strictly
    /// after `restart` (the last KV observed before a commit boundary).
    pub fn group_iterator_page(
        &self,
        session: &Session,
        group: &GroupDef,
        limit: usize,
        restart: Option<&KeyValue>,
    ) -> Result<Vec<KeyValue>, StoreError> {
        let begin = match restart {
            Some(kv) => KeySelector::first_greater_than(kv.key.clone()),
            None => KeySelector::first_greater_or_equal(group.storage.prefix().to_vec()),
        };
        let end = KeySelector::first_greater_or_equal(codec::prefix_end(&group.storage)?);
        let limit = if limit == 0 {
            self.config.group_scan_page_size
        } else {
            limit
        };
        Ok(session.txn().get_range(&begin, &end, limit, false)?)
    }

    //
    // Index iterators
    //

    /// Whole-index scan, optionally reversed.
    pub fn index_iterator<'s>(
        &self,
        session: &'s Session,
        index: &IndexDef,
        reverse: bool,
    ) -> Result<RangeIterator<'s>, StoreError> {
        let begin = index.storage.prefix().to_vec();
        let end = codec::prefix_end(&index.storage)?;
        Ok(session.txn().range_iterator(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            0,
            reverse,
        ))
    }

    /// Bounded index scan from `key`.
    ///
    /// Begin is always less than end; the store carries direction
    /// separately. End bounds are exclusive, and the selectors choose which
    /// key lands there (note the `strinc` on the whole-index edge).
    pub fn index_iterator_at<'s>(
        &self,
        session: &'s Session,
        index: &IndexDef,
        key: &Key,
        inclusive: bool,
        reverse: bool,
    ) -> Result<RangeIterator<'s>, StoreError> {
        let packed_edge = index.storage.prefix().to_vec();
        let packed_key = codec::pack(&index.storage, key);

        let (begin, end) = if inclusive {
            if reverse {
                (
                    KeySelector::first_greater_than(packed_edge),
                    KeySelector::first_greater_than(packed_key),
                )
            } else {
                (
                    KeySelector::first_greater_or_equal(packed_key),
                    KeySelector::first_greater_than(codec::prefix_end(&index.storage)?),
                )
            }
        } else if reverse {
            (
                KeySelector::first_greater_than(packed_edge),
                KeySelector::first_greater_or_equal(packed_key),
            )
        } else {
            (
                KeySelector::first_greater_than(packed_key),
                KeySelector::first_greater_than(codec::prefix_end(&index.storage)?),
            )
        };

        Ok(session.txn().range_iterator(&begin, &end, 0, reverse))
    }

    //
    // Group-index row counts
    //

    pub(crate) fn group_index_count_key(&self, index: &IndexDef) -> Result<Vec<u8>, StoreError> {
        let mut key = self.index_count_prefix()?.to_vec();
        key.extend_from_slice(index.storage.prefix());
        Ok(key)
    }

    /// Exact live row count; adds the cell to the read-conflict set.
    pub fn group_index_count(
        &self,
        session: &Session,
        index: &IndexDef,
    ) -> Result<i64, StoreError> {
        let key = self.group_index_count_key(index)?;
        Ok(decode_count(session.txn().get(&key)?))
    }

    /// Approximate row count through a snapshot read, so concurrent writers
    /// are not serialized against the reader.
    pub fn group_index_count_approximate(
        &self,
        session: &Session,
        index: &IndexDef,
    ) -> Result<i64, StoreError> {
        let key = self.group_index_count_key(index)?;
        Ok(decode_count(session.txn().snapshot_get(&key)?))
    }

    /// Adjust the count cell by `delta` with an atomic ADD; never
    /// read-modify-write.
    pub fn add_group_index_count(
        &self,
        session: &Session,
        index: &IndexDef,
        delta: i64,
    ) -> Result<(), StoreError> {
        let key = self.group_index_count_key(index)?;
        session.txn().add(key, delta);
        Ok(())
    }

    //
    // Whole-object maintenance
    //

    /// Drop each index's data directory; group indexes lose their count cell.
    pub fn delete_indexes(
        &self,
        session: &Session,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        for index in indexes {
            let path = index_data_path(index);
            let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
            self.dirs.remove_if_exists(session.txn(), &borrowed)?;
            if index.is_group_index() {
                session.txn().clear(self.group_index_count_key(index)?);
            }
        }
        Ok(())
    }

    /// Clear each index's rows; group indexes get their count cell reset to
    /// a packed zero (a plain set, not an ADD).
    pub fn truncate_indexes(
        &self,
        session: &Session,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        for index in indexes {
            self.truncate_tree(session, &index.storage)?;
            if index.is_group_index() {
                session
                    .txn()
                    .set(self.group_index_count_key(index)?, 0i64.to_le_bytes().to_vec());
            }
        }
        Ok(())
    }

    /// Drop a table's data directory.
    pub fn remove_table(&self, session: &Session, table: &TableDef) -> Result<(), StoreError> {
        let path = table.name.data_path();
        let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
        self.dirs.remove_if_exists(session.txn(), &borrowed)?;
        Ok(())
    }

    /// Drop sequences: evict their caches, then remove their directories.
    pub fn delete_sequences(
        &self,
        session: &Session,
        sequences: &[&SequenceDef],
    ) -> Result<(), StoreError> {
        for sequence in sequences {
            self.evict_sequence_cache(sequence);
            let path = sequence.name.data_path();
            let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
            self.dirs.remove_if_exists(session.txn(), &borrowed)?;
        }
        Ok(())
    }

    //
    // Row orchestration
    //

    /// Store one table row and maintain its table indexes.
    pub fn write_row(
        &self,
        session: &Session,
        group: &GroupDef,
        row: &RowData,
        hkey: &HKey,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        let result = self.write_row_inner(session, group, row, hkey, indexes);
        self.note_write_failure(session, result)
    }

    fn write_row_inner(
        &self,
        session: &Session,
        group: &GroupDef,
        row: &RowData,
        hkey: &HKey,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        let mut data = StoreData::new(group.storage.clone());
        data.key = hkey.key().clone();
        data.value = Some(row.as_bytes().to_vec());
        self.store(session, &data)?;
        for index in indexes {
            self.write_index_row(session, index, row, hkey)?;
        }
        Ok(())
    }

    /// Delete one table row and its table index entries. Fails with
    /// `RowNotFound` when the group row is absent.
    pub fn delete_row(
        &self,
        session: &Session,
        group: &GroupDef,
        row: &RowData,
        hkey: &HKey,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        let result = self.delete_row_inner(session, group, row, hkey, indexes);
        self.note_write_failure(session, result)
    }

    fn delete_row_inner(
        &self,
        session: &Session,
        group: &GroupDef,
        row: &RowData,
        hkey: &HKey,
        indexes: &[&IndexDef],
    ) -> Result<(), StoreError> {
        let mut data = StoreData::new(group.storage.clone());
        data.key = hkey.key().clone();
        if !self.clear(session, &data)? {
            return Err(StoreError::RowNotFound(hkey.to_string()));
        }
        for index in indexes {
            self.delete_index_row(session, index, row, hkey)?;
        }
        Ok(())
    }

    /// Maintain a group index for an inserted row: write the entry and bump
    /// the count cell.
    pub fn write_group_index_row(
        &self,
        session: &Session,
        index: &IndexDef,
        flattened_row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        let result = self
            .write_index_row(session, index, flattened_row, hkey)
            .and_then(|_| self.add_group_index_count(session, index, 1));
        self.note_write_failure(session, result)
    }

    /// Maintain a group index for a deleted row: drop the entry and decrement
    /// the count cell.
    pub fn delete_group_index_row(
        &self,
        session: &Session,
        index: &IndexDef,
        flattened_row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        let result = self
            .delete_index_row(session, index, flattened_row, hkey)
            .and_then(|_| self.add_group_index_count(session, index, -1));
        self.note_write_failure(session, result)
    }

    /// Look up a parent row's PK index entry by appending the child row's
    /// grouping-join fields onto the parent key prefix. Used when adopting
    /// orphans during hkey assembly.
    pub fn read_parent_index_row(
        &self,
        session: &Session,
        parent_pk_index: &IndexDef,
        parent_key_prefix: &Key,
        child: &TableDef,
        child_row: &RowData,
    ) -> Result<Option<IndexRow>, StoreError> {
        let mut key = parent_key_prefix.clone();
        for field in &child.parent_join_fields {
            key.append(child_row.field(*field)?);
        }
        let packed = codec::pack(&parent_pk_index.storage, &key);
        match session.txn().get(&packed)? {
            Some(value) => {
                let hkey = codec::unpack_hkey_value(&value)?;
                Ok(Some(IndexRow::from_parts(key, hkey)))
            }
            None => Ok(None),
        }
    }

    //
    // Internal
    //

    pub(crate) fn index_count_prefix(&self) -> Result<&[u8], StoreError> {
        self.packed_index_count_prefix
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::Internal("store not started: indexCount unresolved".into()))
    }

    pub(crate) fn index_null_prefix(&self) -> Result<&[u8], StoreError> {
        self.packed_index_null_prefix
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::Internal("store not started: indexNull unresolved".into()))
    }

    /// Mark the session rollback-pending when a write path fails with a
    /// non-retryable error.
    pub(crate) fn note_write_failure<T>(
        &self,
        session: &Session,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if let Err(err) = &result {
            if !err.is_retryable() {
                warn!(error = ?err, "write path failed; marking transaction rollback-pending");
                session.set_rollback_pending();
            }
        }
        result
    }
}

fn index_data_path(index: &IndexDef) -> Vec<String> {
    let mut path = index.name.data_path();
    path.push(index.index_name.clone());
    path
}

fn decode_count(value: Option<Vec<u8>>) -> i64 {
    let mut buf = [0u8; 8];
    if let Some(value) = value {
        let len = value.len().min(8);
        buf[..len].copy_from_slice(&value[..len]);
    }
    i64::from_le_bytes(buf)
}

/// Decoding iterator over the proper descendants of one key.
pub struct DescendantIterator<'s> {
    desc: StorageDescription,
    inner: RangeIterator<'s>,
}

impl<'s> Iterator for DescendantIterator<'s> {
    type Item = Result<(Key, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kv = match self.inner.next()? {
            Ok(kv) => kv,
            Err(err) => return Some(Err(err.into())),
        };
        Some(codec::unpack(&self.desc, &kv.key).map(|key| (key, kv.value)))
    }
}
