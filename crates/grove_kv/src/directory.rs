//! Directory layer: named paths mapped to stable, prefix-free byte prefixes.
//!
//! Directory entries live in a reserved `0xfe` subspace keyed by the
//! tuple-encoded path; the value is the allocated data prefix. Interior
//! path components are virtual: a path "exists" when it or any descendant
//! has an entry, which is what the rename/alter protocol relies on. Moving a
//! path rewrites entry keys only — allocated prefixes (and therefore the
//! data they govern) are preserved across moves.

use std::collections::BTreeSet;

use crate::error::KvError;
use crate::tuple::{pack_segments, strinc, unpack_segments, Segment};
use crate::txn::{KeySelector, Transaction};

const ENTRY_SUBSPACE: u8 = 0xfe;
const ALLOC_COUNTER_KEY: &[u8] = &[0xfd];

/// Client for the directory subspace. Stateless; every operation runs in the
/// caller's transaction.
#[derive(Debug, Default, Clone)]
pub struct DirectoryLayer;

impl DirectoryLayer {
    pub fn new() -> Self {
        Self
    }

    /// Return the packed prefix for `path`, allocating one if the path has
    /// never been created.
    pub fn create_or_open(
        &self,
        txn: &Transaction,
        path: &[&str],
    ) -> Result<Vec<u8>, KvError> {
        if path.is_empty() {
            return Err(KvError::Directory("empty path".into()));
        }
        if let Some(prefix) = self.open(txn, path)? {
            return Ok(prefix);
        }
        let next = match txn.get(ALLOC_COUNTER_KEY)? {
            Some(bytes) => decode_counter(&bytes)? + 1,
            None => 1,
        };
        txn.set(ALLOC_COUNTER_KEY.to_vec(), encode_counter(next));
        let prefix = encode_counter(next);
        txn.set(entry_key(path), prefix.clone());
        Ok(prefix)
    }

    /// Packed prefix for `path` if it has an entry of its own.
    pub fn open(&self, txn: &Transaction, path: &[&str]) -> Result<Option<Vec<u8>>, KvError> {
        txn.get(&entry_key(path))
    }

    /// Whether `path` or any descendant has an entry.
    pub fn exists(&self, txn: &Transaction, path: &[&str]) -> Result<bool, KvError> {
        let begin = entry_key(path);
        let end = strinc(&begin)?;
        let rows = txn.get_range(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            1,
            false,
        )?;
        Ok(!rows.is_empty())
    }

    /// Immediate child names under `path`, in sorted order.
    pub fn list(&self, txn: &Transaction, path: &[&str]) -> Result<Vec<String>, KvError> {
        let mut children = BTreeSet::new();
        for (entry_path, _) in self.subtree(txn, path)? {
            if let Some(child) = entry_path.get(path.len()) {
                children.insert(child.clone());
            }
        }
        Ok(children.into_iter().collect())
    }

    /// Rename `old` (and every descendant entry) to live under `new`.
    /// Allocated prefixes are untouched, so the data moves with the name.
    pub fn move_path(
        &self,
        txn: &Transaction,
        old: &[&str],
        new: &[&str],
    ) -> Result<(), KvError> {
        if self.exists(txn, new)? {
            return Err(KvError::Directory(format!(
                "move target {} already exists",
                new.join("/")
            )));
        }
        let entries = self.subtree(txn, old)?;
        if entries.is_empty() {
            return Err(KvError::Directory(format!(
                "move source {} does not exist",
                old.join("/")
            )));
        }
        for (entry_path, prefix) in entries {
            let mut renamed: Vec<&str> = new.to_vec();
            for segment in &entry_path[old.len()..] {
                renamed.push(segment);
            }
            txn.clear(entry_key_owned(&entry_path));
            txn.set(entry_key(&renamed), prefix);
        }
        Ok(())
    }

    /// Remove `path`, every descendant entry, and all data stored under
    /// their allocated prefixes. Fails if nothing exists at `path`.
    pub fn remove(&self, txn: &Transaction, path: &[&str]) -> Result<(), KvError> {
        if !self.remove_if_exists(txn, path)? {
            return Err(KvError::Directory(format!(
                "{} does not exist",
                path.join("/")
            )));
        }
        Ok(())
    }

    /// Remove like [`remove`](Self::remove), reporting whether anything was
    /// there to delete.
    pub fn remove_if_exists(&self, txn: &Transaction, path: &[&str]) -> Result<bool, KvError> {
        let entries = self.subtree(txn, path)?;
        if entries.is_empty() {
            return Ok(false);
        }
        for (entry_path, prefix) in entries {
            txn.clear_prefix(&prefix)?;
            txn.clear(entry_key_owned(&entry_path));
        }
        Ok(true)
    }

    fn subtree(
        &self,
        txn: &Transaction,
        path: &[&str],
    ) -> Result<Vec<(Vec<String>, Vec<u8>)>, KvError> {
        if path.is_empty() {
            return Err(KvError::Directory("empty path".into()));
        }
        let begin = entry_key(path);
        let end = strinc(&begin)?;
        let rows = txn.get_range(
            &KeySelector::first_greater_or_equal(begin),
            &KeySelector::first_greater_or_equal(end),
            0,
            false,
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for kv in rows {
            out.push((decode_entry_path(&kv.key)?, kv.value));
        }
        Ok(out)
    }
}

fn entry_key(path: &[&str]) -> Vec<u8> {
    let mut out = vec![ENTRY_SUBSPACE];
    let segments: Vec<Segment> = path
        .iter()
        .map(|segment| Segment::Str((*segment).to_string()))
        .collect();
    pack_segments(&mut out, &segments);
    out
}

fn entry_key_owned(path: &[String]) -> Vec<u8> {
    let borrowed: Vec<&str> = path.iter().map(String::as_str).collect();
    entry_key(&borrowed)
}

fn decode_entry_path(key: &[u8]) -> Result<Vec<String>, KvError> {
    if key.first() != Some(&ENTRY_SUBSPACE) {
        return Err(KvError::Directory("entry outside directory subspace".into()));
    }
    let segments = unpack_segments(&key[1..])?;
    segments
        .into_iter()
        .map(|segment| match segment {
            Segment::Str(s) => Ok(s),
            other => Err(KvError::Directory(format!(
                "non-string path segment {other:?}"
            ))),
        })
        .collect()
}

fn encode_counter(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    pack_segments(&mut out, &[Segment::Int(value)]);
    out
}

fn decode_counter(bytes: &[u8]) -> Result<i64, KvError> {
    match unpack_segments(bytes)?.as_slice() {
        [Segment::Int(value)] => Ok(*value),
        _ => Err(KvError::Corrupt("malformed directory counter".into())),
    }
}
