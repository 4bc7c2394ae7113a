//! # MVCC Isolation Tests
//!
//! Snapshot isolation and atomicity across threads: a pinned reader's
//! observations are a pure function of its version, rollback leaves no
//! observable trace, and slabs freed by a version survive while any reader
//! pins it.

use std::sync::Arc;

use clusterdb::{ColumnType, DbOptions, Transaction, Value, DB};

fn mem_db() -> Arc<DB> {
    DB::open(
        None,
        DbOptions {
            in_memory: true,
            ..Default::default()
        },
    )
    .unwrap()
}

fn file_db(dir: &tempfile::TempDir) -> Arc<DB> {
    DB::open(Some(&dir.path().join("db.cdb")), DbOptions::default()).unwrap()
}

fn setup_counter(db: &Arc<DB>) -> clusterdb::ColKey {
    let txn = Transaction::begin_write(db).unwrap();
    let table = txn.add_table("class_counter", false).unwrap();
    let col = table.add_column("count", ColumnType::Int, false).unwrap();
    let obj = table.create_object().unwrap();
    obj.set(col, Value::Int(0)).unwrap();
    txn.commit().unwrap();
    col
}

fn read_counter(txn: &Transaction, col: clusterdb::ColKey) -> i64 {
    let table = txn.get_table("class_counter").unwrap().unwrap();
    table
        .get_object(clusterdb::ObjKey(0))
        .unwrap()
        .get_int(col)
        .unwrap()
}

#[test]
fn reader_is_a_pure_function_of_its_version() {
    let db = mem_db();
    let col = setup_counter(&db);

    let reader = Transaction::begin_read(&db).unwrap();
    let pinned_version = reader.version();
    let pinned_value = read_counter(&reader, col);

    for i in 1..=5 {
        let writer = Transaction::begin_write(&db).unwrap();
        let table = writer.get_table("class_counter").unwrap().unwrap();
        table
            .get_object(clusterdb::ObjKey(0))
            .unwrap()
            .set(col, Value::Int(i))
            .unwrap();
        writer.commit().unwrap();

        // The pinned reader never moves.
        assert_eq!(reader.version(), pinned_version);
        assert_eq!(read_counter(&reader, col), pinned_value);
    }

    let fresh = Transaction::begin_read(&db).unwrap();
    assert_eq!(read_counter(&fresh, col), 5);
}

#[test]
fn concurrent_readers_across_threads_see_consistent_snapshots() {
    let db = mem_db();
    let col = setup_counter(&db);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let reader = Transaction::begin_read(&db).unwrap();
            let first = read_counter(&reader, col);
            // Interleave with writers on the main thread.
            for _ in 0..20 {
                assert_eq!(read_counter(&reader, col), first);
                std::thread::yield_now();
            }
        }));
    }

    for i in 1..=10 {
        let writer = Transaction::begin_write(&db).unwrap();
        let table = writer.get_table("class_counter").unwrap().unwrap();
        table
            .get_object(clusterdb::ObjKey(0))
            .unwrap()
            .set(col, Value::Int(i))
            .unwrap();
        writer.commit().unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn writers_serialize_and_all_commits_land() {
    let db = mem_db();
    let col = setup_counter(&db);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..10 {
                let writer = Transaction::begin_write(&db).unwrap();
                let table = writer.get_table("class_counter").unwrap().unwrap();
                let obj = table.get_object(clusterdb::ObjKey(0)).unwrap();
                obj.add_int(col, 1).unwrap();
                writer.commit().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let reader = Transaction::begin_read(&db).unwrap();
    assert_eq!(read_counter(&reader, col), 40);
}

#[test]
fn rollback_is_atomic_across_mixed_edits() {
    let db = mem_db();
    let col = setup_counter(&db);

    {
        let txn = Transaction::begin_write(&db).unwrap();
        let table = txn.get_table("class_counter").unwrap().unwrap();
        let obj = table.get_object(clusterdb::ObjKey(0)).unwrap();
        obj.set(col, Value::Int(99)).unwrap();
        let extra = table.add_column("extra", ColumnType::String, true).unwrap();
        obj.set(extra, Value::String("doomed".into())).unwrap();
        table.create_object().unwrap();
        txn.add_table("class_other", false).unwrap();
        txn.rollback();
    }

    let reader = Transaction::begin_read(&db).unwrap();
    assert_eq!(read_counter(&reader, col), 0);
    let table = reader.get_table("class_counter").unwrap().unwrap();
    assert_eq!(table.size().unwrap(), 1);
    assert_eq!(table.column_count().unwrap(), 1);
    assert!(reader.get_table("class_other").unwrap().is_none());
}

#[test]
fn snapshot_survives_space_reuse_by_later_writers() {
    // A reader pins version V; subsequent commits free and recycle space.
    // The reader's bytes must stay intact (copy-on-write durability).
    let db = mem_db();
    let txn = Transaction::begin_write(&db).unwrap();
    let table = txn.add_table("class_blob", false).unwrap();
    let col = table.add_column("data", ColumnType::String, false).unwrap();
    let obj = table.create_object().unwrap();
    obj.set(col, Value::String("x".repeat(10_000))).unwrap();
    txn.commit().unwrap();

    let reader = Transaction::begin_read(&db).unwrap();

    // Churn: many commits rewriting the same cell, forcing frees of the
    // old payloads and reuse of reclaimable blocks.
    for i in 0..20 {
        let writer = Transaction::begin_write(&db).unwrap();
        let table = writer.get_table("class_blob").unwrap().unwrap();
        let obj = table.get_object(clusterdb::ObjKey(0)).unwrap();
        obj.set(col, Value::String(format!("{}", i).repeat(5_000)))
            .unwrap();
        writer.commit().unwrap();
    }

    let table = reader.get_table("class_blob").unwrap().unwrap();
    let obj = table.get_object(clusterdb::ObjKey(0)).unwrap();
    assert_eq!(obj.get_string(col).unwrap(), "x".repeat(10_000));
}

#[test]
fn file_backed_snapshot_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_db(&dir);
    let col = setup_counter(&db);

    let reader = Transaction::begin_read(&db).unwrap();
    {
        let writer = Transaction::begin_write(&db).unwrap();
        let table = writer.get_table("class_counter").unwrap().unwrap();
        table
            .get_object(clusterdb::ObjKey(0))
            .unwrap()
            .set(col, Value::Int(7))
            .unwrap();
        writer.commit().unwrap();
    }
    assert_eq!(read_counter(&reader, col), 0);
    drop(reader);

    // Reopen from disk: the last committed state is durable.
    drop(db);
    let db = file_db(&dir);
    let reader = Transaction::begin_read(&db).unwrap();
    assert_eq!(read_counter(&reader, col), 7);
}

#[test]
fn interleaved_writer_and_reader_versions_are_totally_ordered() {
    let db = mem_db();
    let col = setup_counter(&db);

    let mut versions = Vec::new();
    for i in 1..=5 {
        let writer = Transaction::begin_write(&db).unwrap();
        let table = writer.get_table("class_counter").unwrap().unwrap();
        table
            .get_object(clusterdb::ObjKey(0))
            .unwrap()
            .set(col, Value::Int(i))
            .unwrap();
        versions.push(writer.commit().unwrap());
    }
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}
