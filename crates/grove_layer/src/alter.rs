//! Directory moves behind schema alteration.
//!
//! Index-level alters build the new index data out-of-place under
//! `dataAltering/` and this module promotes it into `data/` when the alter
//! finishes. Table- and group-level alters rebuild the table out-of-place
//! instead: the surviving live subpaths are backed up into the staging
//! directory first (skipping any already present after a restart), the old
//! data directory is removed, and the staging directory moves into place as
//! the new live one. All moves run in the caller's transaction, so the whole
//! alter is atomic with the schema swap.

use tracing::debug;

use crate::error::StoreError;
use crate::schema::ObjectName;
use crate::session::Session;
use crate::store::GroveStore;

/// Granularity of a finished schema alteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeLevel {
    /// Nothing changed on disk.
    None,
    /// Name or metadata only.
    Metadata,
    /// Metadata change that also tightened a NOT NULL constraint.
    MetadataNotNull,
    /// One or more indexes were rebuilt out-of-place.
    Index,
    /// The table was rebuilt.
    Table,
    /// The whole group was rebuilt.
    Group,
}

/// Callback surface for the schema manager.
pub trait AlterListener {
    /// A table kept its data but changed its name.
    fn renamed(&mut self, old: &ObjectName, new: &ObjectName);
}

impl GroveStore {
    /// Apply the on-disk half of a finished alter for each `(old, new)` name
    /// pair at the given change level.
    pub fn finished_alter(
        &self,
        session: &Session,
        changes: &[(ObjectName, ObjectName)],
        level: ChangeLevel,
        listener: &mut dyn AlterListener,
    ) -> Result<(), StoreError> {
        if level == ChangeLevel::None {
            return Ok(());
        }

        let txn = session.txn();
        let dirs = self.directory();
        for (old, new) in changes {
            let data_path = old.data_path();
            let alter_path = new.alter_path();
            let data_refs: Vec<&str> = data_path.iter().map(String::as_str).collect();
            let alter_refs: Vec<&str> = alter_path.iter().map(String::as_str).collect();

            match level {
                ChangeLevel::None => unreachable!("handled above"),
                ChangeLevel::Metadata | ChangeLevel::MetadataNotNull => {
                    if old != new {
                        listener.renamed(old, new);
                    }
                }
                ChangeLevel::Index => {
                    if !dirs.exists(txn, &alter_refs)? {
                        continue;
                    }
                    // Promote every staged index into the live directory,
                    // then drop the now-empty staging directory.
                    for sub in dirs.list(txn, &alter_refs)? {
                        let from = child(&alter_refs, &sub);
                        let to = child(&data_refs, &sub);
                        dirs.move_path(txn, &from, &to)?;
                        debug!(from = from.join("/"), to = to.join("/"), "promoted index data");
                    }
                    dirs.remove_if_exists(txn, &alter_refs)?;
                }
                ChangeLevel::Table | ChangeLevel::Group => {
                    if !dirs.exists(txn, &alter_refs)? {
                        continue;
                    }
                    if dirs.exists(txn, &data_refs)? {
                        // Back up live subpaths beside the rebuilt data,
                        // skipping any a previous attempt already moved.
                        for sub in dirs.list(txn, &data_refs)? {
                            let from = child(&data_refs, &sub);
                            let to = child(&alter_refs, &sub);
                            if !dirs.exists(txn, &to)? {
                                dirs.move_path(txn, &from, &to)?;
                            }
                        }
                        dirs.remove_if_exists(txn, &data_refs)?;
                    }
                    dirs.move_path(txn, &alter_refs, &data_refs)?;
                    debug!(table = %new, "swapped rebuilt table into place");
                }
            }
        }
        Ok(())
    }
}

fn child<'a>(parent: &[&'a str], sub: &'a str) -> Vec<&'a str> {
    let mut out: Vec<&str> = parent.to_vec();
    out.push(sub);
    out
}
