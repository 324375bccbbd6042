//! Long scans with cooperative yielding.
//!
//! Whole-object traversals can outlive the store's transaction limits, so
//! the index traversal commits and resets its transaction whenever the scan
//! has run past `scan_time_limit`, optionally sleeping before resuming.
//! Resume begins strictly after the last visited key, so each key is seen at
//! most once and keys that exist across the commit boundary are never
//! skipped.

use std::thread;
use std::time::{Duration, Instant};

use grove_kv::KeySelector;
use tracing::debug;

use crate::codec;
use crate::error::StoreError;
use crate::key::Key;
use crate::row::RowData;
use crate::schema::{GroupDef, IndexDef};
use crate::session::Session;
use crate::store::GroveStore;

/// Visitor over a group's rows in hkey order.
pub trait GroupVisitor {
    fn visit(&mut self, key: &Key, row: &RowData) -> Result<(), StoreError>;
}

/// Visitor over an index's entries in key order. The value is the entry's
/// packed hkey payload.
pub trait IndexVisitor {
    fn visit(&mut self, key: &Key, value: &[u8]) -> Result<(), StoreError>;
}

impl GroveStore {
    /// Visit every row of a group, decoding each KV back into `(key, row)`.
    pub fn traverse_group(
        &self,
        session: &Session,
        group: &GroupDef,
        visitor: &mut dyn GroupVisitor,
    ) -> Result<(), StoreError> {
        let iter = self.group_iterator(session, group)?;
        for kv in iter {
            let kv = kv?;
            session.check_canceled()?;
            let key = codec::unpack(&group.storage, &kv.key)?;
            let row = RowData::from_bytes(kv.value);
            visitor.visit(&key, &row)?;
        }
        Ok(())
    }

    /// Visit every entry of an index in ascending key order, committing the
    /// session's transaction whenever `scan_time_limit` has elapsed since the
    /// transaction began, sleeping `sleep_time` before resuming.
    pub fn traverse_index(
        &self,
        session: &Session,
        index: &IndexDef,
        visitor: &mut dyn IndexVisitor,
        scan_time_limit: Option<Duration>,
        sleep_time: Duration,
    ) -> Result<(), StoreError> {
        let prefix = index.storage.prefix().to_vec();
        let end = KeySelector::first_greater_than(codec::prefix_end(&index.storage)?);
        let mut resume: Option<Vec<u8>> = None;
        let mut commits = 0u64;

        loop {
            let begin = match &resume {
                Some(last) => KeySelector::first_greater_than(last.clone()),
                None => KeySelector::first_greater_or_equal(prefix.clone()),
            };
            let deadline = scan_time_limit.map(|limit| session.txn().start_time() + limit);
            let mut yielded = false;
            {
                let iter = session.txn().range_iterator(&begin, &end, 0, false);
                for kv in iter {
                    let kv = kv?;
                    session.check_canceled()?;
                    let key = codec::unpack(&index.storage, &kv.key)?;
                    visitor.visit(&key, &kv.value)?;
                    resume = Some(kv.key);
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            yielded = true;
                            break;
                        }
                    }
                }
            }
            if !yielded {
                if commits > 0 {
                    debug!(
                        index = %index.qualified_name(),
                        commits,
                        "long index traversal finished"
                    );
                }
                return Ok(());
            }
            // Dispose the iterator and persist progress. The reset (and with
            // it the next deadline's start time) comes only after the sleep,
            // so the pause never eats into the next scan window.
            session.commit()?;
            commits += 1;
            if !sleep_time.is_zero() {
                thread::sleep(sleep_time);
            }
            session.check_canceled()?;
            session.reset();
        }
    }
}
