//! Cached batched sequence allocation.
//!
//! Each sequence keeps one persisted cell holding the start of the next
//! unissued batch. A process-wide cache hands out raw ticks from the current
//! batch under a per-sequence lock; refills advance the persisted cell by
//! `cache_size` in a fresh transaction, so retries never conflict with the
//! caller's statement and a crashed batch only skips ticks, never repeats
//! them. Allocations can go unused when the outer statement rolls back.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::codec;
use crate::error::StoreError;
use crate::schema::SequenceDef;
use crate::session::Session;
use crate::store::GroveStore;

/// One in-process batch: `value` is the last issued raw tick, `limit` the
/// exclusive upper bound of the batch.
#[derive(Debug)]
pub(crate) struct SequenceCache {
    value: i64,
    limit: i64,
}

impl SequenceCache {
    pub(crate) fn empty() -> Self {
        Self { value: 0, limit: 1 }
    }

    fn update(&mut self, start: i64, cache_size: i64) {
        self.value = start;
        self.limit = start + cache_size;
    }

    /// The next raw tick, or None when the batch is exhausted. Exhaustion is
    /// sticky until `update` runs.
    fn next_value(&mut self) -> Option<i64> {
        if self.value + 1 == self.limit {
            return None;
        }
        self.value += 1;
        Some(self.value)
    }

    fn current(&self) -> i64 {
        self.value
    }
}

impl GroveStore {
    /// The next value of `sequence`, refilling the cache from storage when
    /// the current batch is spent.
    pub fn next_sequence_value(
        &self,
        _session: &Session,
        sequence: &SequenceDef,
    ) -> Result<i64, StoreError> {
        sequence.validate()?;
        let entry = self.sequence_cache_entry(sequence);
        let mut cache = entry.lock().unwrap_or_else(|poison| poison.into_inner());
        let raw = match cache.next_value() {
            Some(raw) => raw,
            None => self.refill_sequence_cache(&mut cache, sequence)?,
        };
        Ok(sequence.real_value_for_raw(raw))
    }

    /// Peek at the sequence's current value: the cached tick when a cache
    /// exists, otherwise the persisted cell read in the session's
    /// transaction.
    pub fn current_sequence_value(
        &self,
        session: &Session,
        sequence: &SequenceDef,
    ) -> Result<i64, StoreError> {
        let cached = {
            let caches = self
                .sequence_caches
                .read()
                .unwrap_or_else(|poison| poison.into_inner());
            caches.get(sequence.storage.unique_key()).cloned()
        };
        let raw = match cached {
            Some(entry) => {
                let cache = entry.lock().unwrap_or_else(|poison| poison.into_inner());
                cache.current()
            }
            None => match session.txn().get(sequence.storage.prefix())? {
                Some(bytes) => codec::decode_long_cell(&bytes)?,
                None => 0,
            },
        };
        Ok(sequence.real_value_for_raw(raw))
    }

    /// Drop the in-process cache for `sequence` (DROP SEQUENCE path).
    pub(crate) fn evict_sequence_cache(&self, sequence: &SequenceDef) {
        let mut caches = self
            .sequence_caches
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        caches.remove(sequence.storage.unique_key());
    }

    fn sequence_cache_entry(&self, sequence: &SequenceDef) -> Arc<Mutex<SequenceCache>> {
        {
            let caches = self
                .sequence_caches
                .read()
                .unwrap_or_else(|poison| poison.into_inner());
            if let Some(entry) = caches.get(sequence.storage.unique_key()) {
                return entry.clone();
            }
        }
        let mut caches = self
            .sequence_caches
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        caches
            .entry(sequence.storage.unique_key().to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(SequenceCache::empty())))
            .clone()
    }

    /// Claim the next batch from storage. Runs in a fresh transaction (not
    /// the session's) so a conflict retry here never invalidates the outer
    /// statement; the cache is only updated after the claim commits.
    fn refill_sequence_cache(
        &self,
        cache: &mut SequenceCache,
        sequence: &SequenceDef,
    ) -> Result<i64, StoreError> {
        let prefix = sequence.storage.prefix().to_vec();
        let cache_size = if sequence.cache_size > 0 {
            sequence.cache_size
        } else {
            self.config().default_sequence_cache_size
        };
        let start = self.database().run(move |txn| {
            let start = match txn.get(&prefix)? {
                Some(bytes) => codec::decode_long_cell(&bytes)?,
                None => 1,
            };
            txn.set(prefix.clone(), codec::encode_long_cell(start + cache_size));
            Ok(start)
        })?;
        cache.update(start, cache_size);
        debug!(
            sequence = %sequence.name,
            start,
            cache_size,
            "refilled sequence batch"
        );
        Ok(start)
    }
}
