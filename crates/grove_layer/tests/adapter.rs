//! End-to-end adapter scenarios against the in-memory engine.

use std::sync::Arc;
use std::time::Duration;

use grove_kv::{Database, MemoryEngine, Segment};
use grove_layer::{
    AlterListener, ChangeLevel, GroupDef, GroveStore, HKey, IndexDef, IndexKind, IndexVisitor,
    Key, ObjectName, RowData, SequenceDef, Session, StoreConfig, StoreData, StoreError,
};

fn new_store() -> GroveStore {
    let db = Database::new(Arc::new(MemoryEngine::new()));
    let store = GroveStore::new(db, StoreConfig::default());
    store.start().expect("start");
    store
}

fn group(store: &GroveStore, session: &Session, name: &str) -> GroupDef {
    let storage = store
        .resolve_storage(session, &["data", "test", name])
        .expect("resolve group");
    GroupDef {
        name: ObjectName::new("test", name),
        storage,
    }
}

fn table_index(
    store: &GroveStore,
    session: &Session,
    table: &str,
    index: &str,
    key_columns: Vec<usize>,
    unique: bool,
    nullable_unique: bool,
) -> IndexDef {
    let storage = store
        .resolve_storage(session, &["data", "test", table, index])
        .expect("resolve index");
    IndexDef {
        name: ObjectName::new("test", table),
        index_name: index.to_string(),
        kind: IndexKind::Table,
        key_columns,
        unique,
        unique_and_may_contain_nulls: nullable_unique,
        storage,
    }
}

fn group_index(
    store: &GroveStore,
    session: &Session,
    table: &str,
    index: &str,
    key_columns: Vec<usize>,
    row_composition: Vec<usize>,
) -> IndexDef {
    let storage = store
        .resolve_storage(session, &["data", "test", table, index])
        .expect("resolve group index");
    IndexDef {
        name: ObjectName::new("test", table),
        index_name: index.to_string(),
        kind: IndexKind::Group {
            join: grove_layer::JoinType::Left,
            row_composition,
        },
        key_columns,
        unique: false,
        unique_and_may_contain_nulls: false,
        storage,
    }
}

fn sequence(store: &GroveStore, session: &Session, name: &str, cache_size: i64) -> SequenceDef {
    let storage = store
        .resolve_storage(session, &["data", "test", name])
        .expect("resolve sequence");
    SequenceDef {
        name: ObjectName::new("test", name),
        cache_size,
        start_value: 1,
        increment: 1,
        storage,
    }
}

fn row(fields: &[Segment]) -> RowData {
    RowData::from_fields(fields)
}

#[test]
fn insert_then_read_roundtrips_and_counts() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    let hkey = HKey::root(1, &[Segment::Int(1)]);
    let payload = row(&[Segment::Int(1), Segment::Int(10)]);
    store
        .write_row(&session, &group, &payload, &hkey, &[])
        .unwrap();

    let mut data = StoreData::new(group.storage.clone());
    data.key = hkey.key().clone();
    assert!(store.fetch(&session, &mut data).unwrap());
    let read = RowData::from_bytes(data.value.clone().unwrap());
    assert_eq!(read.field(1).unwrap(), Segment::Int(10));

    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.rows_stored, 1);
    assert_eq!(snapshot.rows_fetched, 1);
    assert_eq!(snapshot.rows_cleared, 0);
}

#[test]
fn unique_index_rejects_second_row_with_same_key() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], true, false);

    let first = row(&[Segment::Int(1), Segment::Int(10)]);
    let second = row(&[Segment::Int(2), Segment::Int(10)]);
    store
        .write_index_row(&session, &index, &first, &HKey::root(1, &[Segment::Int(1)]))
        .unwrap();
    let err = store
        .write_index_row(&session, &index, &second, &HKey::root(1, &[Segment::Int(2)]))
        .unwrap_err();
    match err {
        StoreError::DuplicateKey { index_name, row } => {
            assert_eq!(index_name, "test.t.idx_a");
            assert!(row.contains("10"), "offending row should be formatted: {row}");
        }
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    assert!(session.is_rollback_pending());
}

#[test]
fn deferred_uniqueness_check_fails_at_commit() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], true, false);
    session.begin_deferred_uniqueness_checks();

    let first = row(&[Segment::Int(1), Segment::Int(10)]);
    let second = row(&[Segment::Int(2), Segment::Int(10)]);
    store
        .write_index_row(&session, &index, &first, &HKey::root(1, &[Segment::Int(1)]))
        .unwrap();
    // The duplicate write itself succeeds; the queued check trips at commit.
    store
        .write_index_row(&session, &index, &second, &HKey::root(1, &[Segment::Int(2)]))
        .unwrap();
    assert!(matches!(
        session.commit(),
        Err(StoreError::DuplicateKey { .. })
    ));
}

#[test]
fn nullable_unique_index_accepts_duplicate_nulls_with_distinct_separators() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], true, true);

    let first = row(&[Segment::Int(1), Segment::Null]);
    let second = row(&[Segment::Int(2), Segment::Null]);
    let hkey1 = HKey::root(1, &[Segment::Int(1)]);
    let hkey2 = HKey::root(1, &[Segment::Int(2)]);
    store.write_index_row(&session, &index, &first, &hkey1).unwrap();
    store.write_index_row(&session, &index, &second, &hkey2).unwrap();

    let mut separators = Vec::new();
    for kv in store.index_iterator(&session, &index, false).unwrap() {
        let kv = kv.unwrap();
        let key = grove_layer::codec::unpack(&index.storage, &kv.key).unwrap();
        assert_eq!(key.segments()[0], Segment::Null);
        match key.segments()[1] {
            Segment::Int(sep) => separators.push(sep),
            ref other => panic!("expected separator long, got {other:?}"),
        }
    }
    assert_eq!(separators, vec![1, 2]);

    // The allocator cell advanced to 2, so the next separator is 3.
    assert_eq!(store.null_index_separator_value(&index).unwrap(), 3);
}

#[test]
fn nullable_unique_delete_removes_only_the_matching_hkey() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], true, true);

    let first = row(&[Segment::Int(1), Segment::Null]);
    let second = row(&[Segment::Int(2), Segment::Null]);
    let hkey1 = HKey::root(1, &[Segment::Int(1)]);
    let hkey2 = HKey::root(1, &[Segment::Int(2)]);
    store.write_index_row(&session, &index, &first, &hkey1).unwrap();
    store.write_index_row(&session, &index, &second, &hkey2).unwrap();

    store.delete_index_row(&session, &index, &first, &hkey1).unwrap();

    let remaining: Vec<_> = store
        .index_iterator(&session, &index, false)
        .unwrap()
        .map(|kv| kv.unwrap())
        .collect();
    assert_eq!(remaining.len(), 1);
    let hkey = grove_layer::codec::unpack_hkey_value(&remaining[0].value).unwrap();
    assert_eq!(hkey, hkey2);
}

#[test]
fn group_index_count_tracks_inserts_and_deletes() {
    let store = new_store();
    let session = store.create_session();
    let gi = group_index(&store, &session, "t", "gi_ab", vec![0], vec![0, 1]);

    let rows = [
        row(&[Segment::Int(1), Segment::Int(100)]),
        row(&[Segment::Int(2), Segment::Int(200)]),
        row(&[Segment::Int(3), Segment::Int(300)]),
    ];
    for (i, r) in rows.iter().enumerate() {
        let hkey = HKey::root(1, &[Segment::Int(i as i64 + 1)]);
        store.write_group_index_row(&session, &gi, r, &hkey).unwrap();
    }
    store
        .delete_group_index_row(&session, &gi, &rows[0], &HKey::root(1, &[Segment::Int(1)]))
        .unwrap();

    assert_eq!(store.group_index_count(&session, &gi).unwrap(), 2);
    assert_eq!(
        store.group_index_count_approximate(&session, &gi).unwrap(),
        2
    );

    // Truncation resets the cell with a plain set of packed zero.
    store.truncate_indexes(&session, &[&gi]).unwrap();
    assert_eq!(store.group_index_count(&session, &gi).unwrap(), 0);
}

#[test]
fn sequence_batches_are_monotone_and_advance_the_cell() {
    let store = new_store();
    let session = store.create_session();
    let seq = sequence(&store, &session, "seq_a", 5);
    session.commit_and_reset().unwrap();

    let mut values = Vec::new();
    for _ in 0..10 {
        values.push(store.next_sequence_value(&session, &seq).unwrap());
    }
    assert_eq!(values, (1..=10).collect::<Vec<i64>>());

    // The persisted cell holds the start of the next unissued batch.
    let check = store.create_session();
    let cell = check.txn().get(seq.storage.prefix()).unwrap().unwrap();
    assert_eq!(grove_layer::codec::decode_long_cell(&cell).unwrap(), 11);

    assert_eq!(store.current_sequence_value(&session, &seq).unwrap(), 10);
}

#[test]
fn sequence_cell_advances_batch_by_batch() {
    let store = new_store();
    let session = store.create_session();
    let seq = sequence(&store, &session, "seq_b", 5);
    session.commit_and_reset().unwrap();

    assert_eq!(store.next_sequence_value(&session, &seq).unwrap(), 1);
    let check = store.create_session();
    let cell = check.txn().get(seq.storage.prefix()).unwrap().unwrap();
    assert_eq!(grove_layer::codec::decode_long_cell(&cell).unwrap(), 6);
}

#[test]
fn descendant_iterator_yields_proper_descendants_only() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    let customer = HKey::root(1, &[Segment::Int(1)]);
    let order_a = HKey::child(&customer, 2, &[Segment::Int(10)]);
    let order_b = HKey::child(&customer, 2, &[Segment::Int(11)]);
    let other_customer = HKey::root(1, &[Segment::Int(2)]);
    for (hkey, marker) in [
        (&customer, 1i64),
        (&order_a, 2),
        (&order_b, 3),
        (&other_customer, 4),
    ] {
        store
            .write_row(&session, &group, &row(&[Segment::Int(marker)]), hkey, &[])
            .unwrap();
    }

    let mut data = StoreData::new(group.storage.clone());
    data.key = customer.key().clone();
    let visited: Vec<Key> = store
        .descendant_iterator(&session, &data)
        .map(|item| item.unwrap().0)
        .collect();
    assert_eq!(visited.len(), 2);
    assert_eq!(visited[0], order_a.key().clone());
    assert_eq!(visited[1], order_b.key().clone());

    // The subtree iterator additionally includes the row itself.
    let subtree: Vec<_> = store
        .group_iterator_at(&session, &group, &customer)
        .map(|kv| kv.unwrap())
        .collect();
    assert_eq!(subtree.len(), 3);
}

#[test]
fn index_iterator_boundaries_respect_inclusive_and_reverse() {
    let store = new_store();
    let session = store.create_session();
    // Unique index: the stored key is exactly the key columns, so the
    // inclusive/exclusive boundary falls on the probed key itself.
    let index = table_index(&store, &session, "t", "idx_a", vec![1], true, false);

    for (pk, a) in [(1i64, 10i64), (2, 20), (3, 30)] {
        let r = row(&[Segment::Int(pk), Segment::Int(a)]);
        store
            .write_index_row(&session, &index, &r, &HKey::root(1, &[Segment::Int(pk)]))
            .unwrap();
    }

    let first_col = |key: &Key| match key.segments()[0] {
        Segment::Int(v) => v,
        _ => panic!("non-int index column"),
    };
    let scan = |key_value: i64, inclusive: bool, reverse: bool| -> Vec<i64> {
        let mut key = Key::new();
        key.append_int(key_value);
        store
            .index_iterator_at(&session, &index, &key, inclusive, reverse)
            .unwrap()
            .map(|kv| {
                let kv = kv.unwrap();
                first_col(&grove_layer::codec::unpack(&index.storage, &kv.key).unwrap())
            })
            .collect()
    };

    assert_eq!(scan(20, true, false), vec![20, 30]);
    assert_eq!(scan(20, false, false), vec![30]);
    assert_eq!(scan(20, true, true), vec![20, 10]);
    assert_eq!(scan(20, false, true), vec![10]);
    // A key between entries behaves the same either way.
    assert_eq!(scan(25, true, false), vec![30]);
    assert_eq!(scan(25, false, true), vec![20, 10]);
}

#[test]
fn clear_reports_prior_existence() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    let hkey = HKey::root(1, &[Segment::Int(1)]);
    store
        .write_row(&session, &group, &row(&[Segment::Int(1)]), &hkey, &[])
        .unwrap();

    let mut data = StoreData::new(group.storage.clone());
    data.key = hkey.key().clone();
    assert!(store.clear(&session, &data).unwrap());
    assert!(!store.clear(&session, &data).unwrap());
}

#[test]
fn delete_row_of_missing_row_fails_and_marks_rollback() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    let hkey = HKey::root(1, &[Segment::Int(99)]);
    let err = store
        .delete_row(&session, &group, &row(&[Segment::Int(99)]), &hkey, &[])
        .unwrap_err();
    assert!(matches!(err, StoreError::RowNotFound(_)));
    assert!(session.is_rollback_pending());
}

#[test]
fn resumable_group_scan_pages_without_overlap() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    for pk in 0..25i64 {
        let hkey = HKey::root(1, &[Segment::Int(pk)]);
        store
            .write_row(&session, &group, &row(&[Segment::Int(pk)]), &hkey, &[])
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut restart = None;
    loop {
        let page = store
            .group_iterator_page(&session, &group, 10, restart.as_ref())
            .unwrap();
        if page.is_empty() {
            break;
        }
        seen.extend(page.iter().map(|kv| kv.key.clone()));
        restart = page.last().cloned();
    }
    assert_eq!(seen.len(), 25);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

struct CollectingVisitor {
    keys: Vec<Key>,
}

impl IndexVisitor for CollectingVisitor {
    fn visit(&mut self, key: &Key, _value: &[u8]) -> Result<(), StoreError> {
        self.keys.push(key.clone());
        Ok(())
    }
}

#[test]
fn long_traversal_visits_every_key_once_across_commits() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], false, false);

    for pk in 0..10_000i64 {
        let r = row(&[Segment::Int(pk), Segment::Int(pk * 2)]);
        store
            .write_index_row(&session, &index, &r, &HKey::root(1, &[Segment::Int(pk)]))
            .unwrap();
    }
    session.commit_and_reset().unwrap();

    let mut visitor = CollectingVisitor { keys: Vec::new() };
    store
        .traverse_index(
            &session,
            &index,
            &mut visitor,
            Some(Duration::from_millis(1)),
            Duration::ZERO,
        )
        .unwrap();

    assert_eq!(visitor.keys.len(), 10_000);
    assert!(visitor.keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn long_traversal_with_sleep_still_visits_every_key_once() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], false, false);

    for pk in 0..300i64 {
        let r = row(&[Segment::Int(pk), Segment::Int(pk + 1)]);
        store
            .write_index_row(&session, &index, &r, &HKey::root(1, &[Segment::Int(pk)]))
            .unwrap();
    }
    session.commit_and_reset().unwrap();

    let mut visitor = CollectingVisitor { keys: Vec::new() };
    store
        .traverse_index(
            &session,
            &index,
            &mut visitor,
            Some(Duration::from_millis(1)),
            Duration::from_millis(2),
        )
        .unwrap();

    assert_eq!(visitor.keys.len(), 300);
    assert!(visitor.keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn canceled_session_unwinds_traversal() {
    let store = new_store();
    let session = store.create_session();
    let index = table_index(&store, &session, "t", "idx_a", vec![1], false, false);
    let r = row(&[Segment::Int(1), Segment::Int(2)]);
    store
        .write_index_row(&session, &index, &r, &HKey::root(1, &[Segment::Int(1)]))
        .unwrap();

    session.cancel();
    let mut visitor = CollectingVisitor { keys: Vec::new() };
    let err = store
        .traverse_index(&session, &index, &mut visitor, None, Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, StoreError::QueryCanceled));
    assert!(visitor.keys.is_empty());
}

#[derive(Default)]
struct RenameLog {
    renames: Vec<(String, String)>,
}

impl AlterListener for RenameLog {
    fn renamed(&mut self, old: &ObjectName, new: &ObjectName) {
        self.renames.push((old.to_string(), new.to_string()));
    }
}

#[test]
fn metadata_alter_only_notifies_on_rename() {
    let store = new_store();
    let session = store.create_session();
    let mut log = RenameLog::default();

    let same = ObjectName::new("test", "t");
    let renamed = ObjectName::new("test", "t2");
    store
        .finished_alter(
            &session,
            &[(same.clone(), same.clone()), (same.clone(), renamed.clone())],
            ChangeLevel::Metadata,
            &mut log,
        )
        .unwrap();
    assert_eq!(log.renames, vec![("test.t".to_string(), "test.t2".to_string())]);
}

#[test]
fn index_alter_promotes_staged_directories() {
    let store = new_store();
    let session = store.create_session();
    let mut log = RenameLog::default();
    let dirs = store.directory();
    let txn = session.txn();

    // Live table data plus a staged out-of-place index build.
    dirs.create_or_open(txn, &["data", "test", "t"]).unwrap();
    let staged_prefix = dirs
        .create_or_open(txn, &["dataAltering", "test", "t", "idx_new"])
        .unwrap();
    let mut staged_row = staged_prefix.clone();
    staged_row.extend_from_slice(b"entry");
    txn.set(staged_row.clone(), b"v".to_vec());

    let name = ObjectName::new("test", "t");
    store
        .finished_alter(
            &session,
            &[(name.clone(), name.clone())],
            ChangeLevel::Index,
            &mut log,
        )
        .unwrap();

    assert_eq!(
        dirs.open(txn, &["data", "test", "t", "idx_new"]).unwrap(),
        Some(staged_prefix)
    );
    assert!(!dirs.exists(txn, &["dataAltering", "test", "t"]).unwrap());
    // The prefix survived the move, so the staged entry is now live data.
    assert_eq!(txn.get(&staged_row).unwrap(), Some(b"v".to_vec()));
}

#[test]
fn table_alter_swaps_rebuilt_data_and_keeps_untouched_subpaths() {
    let store = new_store();
    let session = store.create_session();
    let mut log = RenameLog::default();
    let dirs = store.directory();
    let txn = session.txn();

    let old_prefix = dirs.create_or_open(txn, &["data", "test", "t"]).unwrap();
    let mut old_row = old_prefix.clone();
    old_row.extend_from_slice(b"old");
    txn.set(old_row.clone(), b"old".to_vec());

    let pk_prefix = dirs
        .create_or_open(txn, &["data", "test", "t", "pk"])
        .unwrap();
    let mut pk_row = pk_prefix.clone();
    pk_row.extend_from_slice(b"pk");
    txn.set(pk_row.clone(), b"pk".to_vec());

    let rebuilt_prefix = dirs
        .create_or_open(txn, &["dataAltering", "test", "t"])
        .unwrap();
    let mut rebuilt_row = rebuilt_prefix.clone();
    rebuilt_row.extend_from_slice(b"new");
    txn.set(rebuilt_row.clone(), b"new".to_vec());

    let name = ObjectName::new("test", "t");
    store
        .finished_alter(
            &session,
            &[(name.clone(), name.clone())],
            ChangeLevel::Table,
            &mut log,
        )
        .unwrap();

    // The rebuilt directory is live now; the old table data is gone; the
    // untouched pk subpath rode along with its prefix intact.
    assert_eq!(
        dirs.open(txn, &["data", "test", "t"]).unwrap(),
        Some(rebuilt_prefix)
    );
    assert_eq!(
        dirs.open(txn, &["data", "test", "t", "pk"]).unwrap(),
        Some(pk_prefix)
    );
    assert!(!dirs.exists(txn, &["dataAltering", "test", "t"]).unwrap());
    assert_eq!(txn.get(&rebuilt_row).unwrap(), Some(b"new".to_vec()));
    assert_eq!(txn.get(&pk_row).unwrap(), Some(b"pk".to_vec()));
    assert_eq!(txn.get(&old_row).unwrap(), None);
}

#[test]
fn tree_exists_reflects_stored_rows() {
    let store = new_store();
    let session = store.create_session();
    let group = group(&store, &session, "t");

    assert!(!store.tree_exists(&session, &group.storage).unwrap());
    let hkey = HKey::root(1, &[Segment::Int(1)]);
    store
        .write_row(&session, &group, &row(&[Segment::Int(1)]), &hkey, &[])
        .unwrap();
    assert!(store.tree_exists(&session, &group.storage).unwrap());

    store.truncate_tree(&session, &group.storage).unwrap();
    assert!(!store.tree_exists(&session, &group.storage).unwrap());
}
