//! Integration coverage for the fjall-backed engine behind the transaction
//! and directory layers.

use std::sync::Arc;

use anyhow::Result;
use grove_kv::{Database, DirectoryLayer, FjallEngine, KeySelector, MemoryEngine};

#[test]
fn durable_engine_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let engine = FjallEngine::open(dir.path())?;
        let db = Database::new(Arc::new(engine));
        let txn = db.create_transaction();
        txn.set(b"k1".to_vec(), b"v1".to_vec());
        txn.set(b"k2".to_vec(), b"v2".to_vec());
        txn.commit()?;
    }

    let engine = FjallEngine::open(dir.path())?;
    let db = Database::new(Arc::new(engine));
    let txn = db.create_transaction();
    assert_eq!(txn.get(b"k1")?, Some(b"v1".to_vec()));
    assert_eq!(txn.get(b"k2")?, Some(b"v2".to_vec()));
    Ok(())
}

#[test]
fn directory_layer_behaves_the_same_on_both_engines() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engines: Vec<Arc<dyn grove_kv::StorageEngine>> = vec![
        Arc::new(MemoryEngine::new()),
        Arc::new(FjallEngine::open(dir.path())?),
    ];

    for engine in engines {
        let db = Database::new(engine);
        let dirs = DirectoryLayer::new();

        let prefix = db.run(|txn| dirs.create_or_open(txn, &["data", "s", "t"]))?;

        let txn = db.create_transaction();
        let mut row_key = prefix.clone();
        row_key.extend_from_slice(b"row1");
        txn.set(row_key.clone(), b"payload".to_vec());
        txn.commit()?;

        let txn = db.create_transaction();
        assert_eq!(dirs.open(&txn, &["data", "s", "t"])?, Some(prefix.clone()));
        let rows = txn.get_range(
            &KeySelector::first_greater_or_equal(prefix.clone()),
            &KeySelector::first_greater_or_equal(grove_kv::strinc(&prefix)?),
            0,
            false,
        )?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"payload".to_vec());
    }
    Ok(())
}

#[test]
fn conflicting_commits_retry_to_success() -> Result<()> {
    let db = Database::new(Arc::new(MemoryEngine::new()));

    // Two interleaved increments of the same cell: the second transaction's
    // read is invalidated by the first commit and must fail.
    let a = db.create_transaction();
    let b = db.create_transaction();
    let read = |txn: &grove_kv::Transaction| -> Result<i64> {
        Ok(txn
            .get(b"cell")?
            .map(|v| i64::from_le_bytes(v.try_into().unwrap()))
            .unwrap_or(0))
    };
    let a_val = read(&a)?;
    let b_val = read(&b)?;
    a.set(b"cell".to_vec(), (a_val + 1).to_le_bytes().to_vec());
    b.set(b"cell".to_vec(), (b_val + 1).to_le_bytes().to_vec());
    a.commit()?;
    let err = b.commit().unwrap_err();
    assert!(err.is_retryable());

    // Retrying through Database::run lands the second increment.
    db.run(|txn| {
        let current = txn
            .get(b"cell")?
            .map(|v| i64::from_le_bytes(v.try_into().unwrap()))
            .unwrap_or(0);
        txn.set(b"cell".to_vec(), (current + 1).to_le_bytes().to_vec());
        Ok(())
    })?;

    let check = db.create_transaction();
    assert_eq!(read(&check)?, 2);
    Ok(())
}
