//! Index row construction, uniqueness checking, and index maintenance.
//!
//! On-disk layout per index entry:
//! - unique index: key = key columns, value = packed hkey;
//! - nullable-unique index: key = key columns ++ null separator, value =
//!   packed hkey. The separator is 0 when no key column is null (uniqueness
//!   is enforced on the column prefix alone) and a freshly allocated positive
//!   long otherwise, so duplicate-null rows stay distinct on disk;
//! - non-unique index: key = key columns ++ hkey segments (making the disk
//!   key unique), value = packed hkey.
//!
//! The value always carries the row's hkey: index -> row is a lookup edge,
//! never ownership.

use grove_kv::{KeySelector, KeyValue};
use tracing::{debug, warn};

use crate::codec;
use crate::error::StoreError;
use crate::key::{HKey, Key};
use crate::row::RowData;
use crate::schema::{IndexDef, IndexKind};
use crate::session::Session;
use crate::store::GroveStore;

/// A decoded index entry: the on-disk key plus the hkey recovered from the
/// value. Instances are pooled per store; rent with `take_index_row` and give
/// back with `return_index_row`.
#[derive(Debug, Clone, Default)]
pub struct IndexRow {
    key: Key,
    hkey: HKey,
}

impl IndexRow {
    pub fn from_parts(key: Key, hkey: HKey) -> Self {
        Self { key, hkey }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn hkey(&self) -> &HKey {
        &self.hkey
    }

    /// Re-initialize from one scanned KV pair.
    pub fn copy_from(&mut self, index: &IndexDef, kv: &KeyValue) -> Result<(), StoreError> {
        self.key = codec::unpack(&index.storage, &kv.key)?;
        self.hkey = codec::unpack_hkey_value(&kv.value)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.key.clear();
        self.hkey = HKey::new();
    }
}

/// A uniqueness probe whose failure is reported later. The probe itself runs
/// when the check is created (so it sees everything written before the row in
/// question, and not the row itself); batched mode only defers the error to
/// commit time.
#[derive(Debug)]
pub struct PendingCheck {
    index_name: String,
    row: String,
    duplicate: bool,
}

impl PendingCheck {
    pub fn run(&self) -> Result<(), StoreError> {
        if self.duplicate {
            warn!(
                index = %self.index_name,
                row = %self.row,
                "deferred uniqueness check found an existing row"
            );
            Err(StoreError::DuplicateKey {
                index_name: self.index_name.clone(),
                row: self.row.clone(),
            })
        } else {
            Ok(())
        }
    }
}

impl GroveStore {
    /// Build and write the index entry for `row`/`hkey`, enforcing
    /// uniqueness where the index demands it.
    pub fn write_index_row(
        &self,
        session: &Session,
        index: &IndexDef,
        row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        let result = self.write_index_row_inner(session, index, row, hkey);
        self.note_write_failure(session, result)
    }

    fn write_index_row_inner(
        &self,
        session: &Session,
        index: &IndexDef,
        row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        let (index_key, value, any_null) = self.construct_index_row(index, row, hkey, true)?;
        self.check_uniqueness(session, index, row, &index_key, any_null)?;
        session
            .txn()
            .set(codec::pack(&index.storage, &index_key), value);
        Ok(())
    }

    /// Remove the index entry for `row`/`hkey`.
    pub fn delete_index_row(
        &self,
        session: &Session,
        index: &IndexDef,
        row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        let result = self.delete_index_row_inner(session, index, row, hkey);
        self.note_write_failure(session, result)
    }

    fn delete_index_row_inner(
        &self,
        session: &Session,
        index: &IndexDef,
        row: &RowData,
        hkey: &HKey,
    ) -> Result<(), StoreError> {
        if index.unique_and_may_contain_nulls {
            // The on-disk key ends in a separator we cannot rebuild. Start at
            // the column prefix with separator 0 and walk forward until the
            // entry whose value decodes to the caller's hkey.
            let (index_key, _, _) = self.construct_index_row(index, row, hkey, false)?;
            let begin = codec::pack(&index.storage, &index_key);
            let end = codec::prefix_end(&index.storage)?;
            let mut entry = self.take_index_row();
            let mut doomed: Option<Vec<u8>> = None;
            {
                let iter = session.txn().range_iterator(
                    &KeySelector::first_greater_or_equal(begin),
                    &KeySelector::first_greater_or_equal(end),
                    0,
                    false,
                );
                for kv in iter {
                    let kv = kv?;
                    entry.copy_from(index, &kv)?;
                    if entry.hkey() == hkey {
                        doomed = Some(kv.key);
                        break;
                    }
                }
            }
            self.return_index_row(entry);
            if let Some(key) = doomed {
                session.txn().clear(key);
            }
        } else {
            let (index_key, _, _) = self.construct_index_row(index, row, hkey, false)?;
            session.txn().clear(codec::pack(&index.storage, &index_key));
        }
        Ok(())
    }

    /// Allocate the next null separator for a nullable-unique index. Runs in
    /// its own transaction so bulk inserts do not serialize on the cell; an
    /// allocation may therefore go unused if the outer statement rolls back.
    pub fn null_index_separator_value(&self, index: &IndexDef) -> Result<i64, StoreError> {
        let mut cell_key = self.index_null_prefix()?.to_vec();
        cell_key.extend_from_slice(index.storage.prefix());
        let out = self.database().run(move |txn| {
            let mut next = 1i64;
            if let Some(bytes) = txn.get(&cell_key)? {
                next += codec::decode_long_cell(&bytes)?;
            }
            txn.set(cell_key.clone(), codec::encode_long_cell(next));
            Ok(next)
        })?;
        Ok(out)
    }

    /// Populate the index key (and value) for one row. `for_insert` controls
    /// separator allocation on nullable-unique indexes; deletes probe with 0.
    fn construct_index_row(
        &self,
        index: &IndexDef,
        row: &RowData,
        hkey: &HKey,
        for_insert: bool,
    ) -> Result<(Key, Vec<u8>, bool), StoreError> {
        index.validate()?;
        let mut key = Key::new();
        let mut any_null = false;
        for position in key_positions(index) {
            let segment = row.field(*position)?;
            any_null |= segment.is_null();
            key.append(segment);
        }
        if index.unique_and_may_contain_nulls {
            let separator = if any_null && for_insert {
                let value = self.null_index_separator_value(index)?;
                debug!(
                    index = %index.qualified_name(),
                    separator = value,
                    "allocated null separator"
                );
                value
            } else {
                0
            };
            key.append_int(separator);
        }
        if !index.unique {
            for segment in hkey.segments() {
                key.append(segment.clone());
            }
        }
        Ok((key, codec::pack_hkey_value(hkey), any_null))
    }

    fn check_uniqueness(
        &self,
        session: &Session,
        index: &IndexDef,
        row: &RowData,
        index_key: &Key,
        any_null: bool,
    ) -> Result<(), StoreError> {
        if !index.unique || any_null {
            return Ok(());
        }
        // A nullable-unique key carries the trailing separator (0 here, since
        // nothing was null); include it in the probe depth.
        let mut depth = index.key_columns.len();
        if index.unique_and_may_contain_nulls {
            depth += 1;
        }
        let probe = index_key.truncated(depth);
        let begin = codec::pack(&index.storage, &probe);
        let end = grove_kv::strinc(&begin).map_err(StoreError::from)?;
        let existing = session.txn().get_range(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            1,
            false,
        )?;
        let duplicate = !existing.is_empty();
        let index_name = index.qualified_name();
        let row_display = self.format_index_row(index, row)?;
        let check = PendingCheck {
            index_name: index_name.clone(),
            row: row_display.clone(),
            duplicate,
        };
        if session.defer_check(check) {
            return Ok(());
        }
        if duplicate {
            warn!(
                index = %index_name,
                row = %row_display,
                "uniqueness check found an existing row"
            );
            return Err(StoreError::DuplicateKey {
                index_name,
                row: row_display,
            });
        }
        Ok(())
    }

    /// Render the offending key column values for a duplicate-key error.
    fn format_index_row(&self, index: &IndexDef, row: &RowData) -> Result<String, StoreError> {
        let mut key = Key::new();
        for position in key_positions(index) {
            key.append(row.field(*position)?);
        }
        Ok(key.to_string())
    }

    pub(crate) fn take_index_row(&self) -> IndexRow {
        self.index_row_pool
            .lock()
            .map(|mut pool| pool.pop())
            .unwrap_or(None)
            .unwrap_or_default()
    }

    pub(crate) fn return_index_row(&self, mut row: IndexRow) {
        row.reset();
        if let Ok(mut pool) = self.index_row_pool.lock() {
            pool.push(row);
        }
    }
}

/// Row positions feeding the index key, in declared order. Group indexes read
/// through their row composition; table indexes use the key columns directly.
fn key_positions(index: &IndexDef) -> &[usize] {
    match &index.kind {
        IndexKind::Table => &index.key_columns,
        IndexKind::Group {
            row_composition, ..
        } => &row_composition[..index.key_columns.len()],
    }
}
