//! # Change Notification Tests
//!
//! Local commits deliver `did_change` synchronously; commits through a
//! second instance on the same file arrive asynchronously through the
//! notification file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clusterdb::{BindingContext, ObjectSchema, Property, Realm, RealmConfig, Schema};
use tempfile::TempDir;

struct CountingContext {
    changes: Arc<AtomicUsize>,
}

impl BindingContext for CountingContext {
    fn did_change(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config(dir: &TempDir) -> RealmConfig {
    RealmConfig {
        path: Some(dir.path().join("test.cdb")),
        schema_version: Some(0),
        schema: Some(Schema::new(vec![ObjectSchema::new(
            "object",
            vec![Property::int("value")],
        )])),
        cache: Some(false),
        ..Default::default()
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn local_notifications_are_sent_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let realm = Realm::open(test_config(&dir)).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    realm.set_binding_context(Box::new(CountingContext {
        changes: changes.clone(),
    }));

    realm.begin_transaction().unwrap();
    assert_eq!(changes.load(Ordering::SeqCst), 0);
    realm.commit_transaction().unwrap();
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[test]
fn remote_notifications_are_sent_asynchronously() {
    let dir = tempfile::tempdir().unwrap();
    let realm = Realm::open(test_config(&dir)).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    realm.set_binding_context(Box::new(CountingContext {
        changes: changes.clone(),
    }));

    let realm2 = Realm::open(test_config(&dir)).unwrap();
    realm2.begin_transaction().unwrap();
    realm2.commit_transaction().unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || changes.load(Ordering::SeqCst) > 0),
        "asynchronous notification never arrived"
    );
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[test]
fn remote_commit_advances_reader_after_notification() {
    let dir = tempfile::tempdir().unwrap();
    let realm = Realm::open(test_config(&dir)).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    realm.set_binding_context(Box::new(CountingContext {
        changes: changes.clone(),
    }));

    let realm2 = Realm::open(test_config(&dir)).unwrap();
    realm2
        .write(|txn| {
            let table = txn.get_table("class_object")?.expect("table exists");
            table.create_object()?;
            Ok(())
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        changes.load(Ordering::SeqCst) > 0
    }));
    realm
        .read(|txn| {
            let table = txn.get_table("class_object")?.expect("table exists");
            assert_eq!(table.size()?, 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn own_commit_does_not_echo_through_the_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let realm = Realm::open(test_config(&dir)).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    realm.set_binding_context(Box::new(CountingContext {
        changes: changes.clone(),
    }));

    realm.begin_transaction().unwrap();
    realm.commit_transaction().unwrap();
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    // Give the notifier time to observe the note file; the local commit
    // must not be delivered a second time.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}
