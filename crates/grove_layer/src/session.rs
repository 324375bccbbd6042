//! Sessions: one live transaction plus per-statement bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use grove_kv::{Database, Transaction};
use tracing::warn;

use crate::error::StoreError;
use crate::index::PendingCheck;

/// Carrier for one caller's interaction with the layer. A session owns
/// exactly one active transaction at a time; resetting or committing it is
/// always explicit.
pub struct Session {
    txn: Transaction,
    rollback_pending: AtomicBool,
    canceled: AtomicBool,
    pending_checks: Mutex<Option<Vec<PendingCheck>>>,
}

impl Session {
    pub fn new(db: &Database) -> Self {
        Self {
            txn: db.create_transaction(),
            rollback_pending: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            pending_checks: Mutex::new(None),
        }
    }

    /// The session's current transaction.
    pub fn txn(&self) -> &Transaction {
        &self.txn
    }

    /// Resolve any deferred uniqueness checks, then commit the transaction.
    pub fn commit(&self) -> Result<(), StoreError> {
        for check in self.drain_pending_checks() {
            check.run()?;
        }
        self.txn.commit()?;
        Ok(())
    }

    /// Abandon pending work (including deferred checks) and start a fresh
    /// transaction at a new read version.
    pub fn reset(&self) {
        self.drain_pending_checks();
        self.rollback_pending.store(false, Ordering::Relaxed);
        self.txn.reset();
    }

    /// Commit and immediately begin a new transaction.
    pub fn commit_and_reset(&self) -> Result<(), StoreError> {
        self.commit()?;
        self.txn.reset();
        Ok(())
    }

    /// Mark the transaction as needing rollback after a failed write path.
    pub fn set_rollback_pending(&self) {
        self.rollback_pending.store(true, Ordering::Relaxed);
    }

    pub fn is_rollback_pending(&self) -> bool {
        self.rollback_pending.load(Ordering::Relaxed)
    }

    /// Request cancellation; raised at the next suspension point.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn check_canceled(&self) -> Result<(), StoreError> {
        if self.canceled.load(Ordering::Relaxed) {
            warn!("session canceled; unwinding at suspension point");
            Err(StoreError::QueryCanceled)
        } else {
            Ok(())
        }
    }

    /// Switch uniqueness checks to batched mode: subsequent index writes
    /// queue their existence probes, and `commit` resolves the batch before
    /// committing. Bulk inserts use this to avoid a blocking read per row.
    pub fn begin_deferred_uniqueness_checks(&self) {
        let mut slot = self.lock_checks();
        if slot.is_none() {
            *slot = Some(Vec::new());
        }
    }

    /// Resolve and discard any queued checks now, without committing.
    pub fn run_pending_checks(&self) -> Result<(), StoreError> {
        for check in self.drain_pending_checks() {
            check.run()?;
        }
        Ok(())
    }

    /// Queue `check` if batched mode is on. Returns false when the caller
    /// must resolve the check inline.
    pub(crate) fn defer_check(&self, check: PendingCheck) -> bool {
        let mut slot = self.lock_checks();
        match slot.as_mut() {
            Some(queue) => {
                queue.push(check);
                true
            }
            None => false,
        }
    }

    fn drain_pending_checks(&self) -> Vec<PendingCheck> {
        let mut slot = self.lock_checks();
        match slot.as_mut() {
            Some(queue) => std::mem::take(queue),
            None => Vec::new(),
        }
    }

    fn lock_checks(&self) -> std::sync::MutexGuard<'_, Option<Vec<PendingCheck>>> {
        self.pending_checks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
