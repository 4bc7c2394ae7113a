//! # Shared Group
//!
//! The process-facing database object: one open handle on a database file
//! (or in-memory image), owning the slab allocator, the MVCC control
//! region, the writer locks, and the commit-notification channel.
//!
//! ## Transaction Arbitration
//!
//! Many read transactions may be live at once, across threads and
//! processes; at most one write transaction exists per file. In-process
//! writer exclusion uses a condition variable; cross-process exclusion
//! takes an advisory lock on the database file for the duration of the
//! write. Reader registration pins a version-ring entry in the control
//! region and never blocks on a writer.
//!
//! ## Commit Pipeline
//!
//! 1. append the transaction's changeset to the history;
//! 2. persist the free list (transaction frees tagged with the new
//!    version) and flush the group top;
//! 3. write the transaction's slabs into the file and sync;
//! 4. flip the file-header top-ref slot (crash-safe double buffer);
//! 5. publish the version in the ring and bump the notification file.
//!
//! A commit that cannot get a ring slot fails before any file mutation, so
//! the previous version simply stays current; rollback is dropping the
//! transaction allocator.
//!
//! ## Change Notification
//!
//! File-backed databases keep a sibling `<path>.note` file whose 8 bytes
//! hold the newest committed version. A notifier thread per handle polls
//! it and invokes registered listeners when another handle (possibly in
//! another process) commits. Failure to create the file aborts `open`.

pub mod control;
pub mod transaction;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use eyre::Result;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};

use crate::alloc::{FileMap, FreeList, SlabAlloc, FILE_HEADER_SIZE};
use crate::crypto::PageCipher;
use crate::error::{err, ErrorKind};
use crate::group::Group;

use control::{ControlRegion, VersionInfo};

const NOTE_POLL_INTERVAL: Duration = Duration::from_millis(30);
const RING_WAIT_STEP: Duration = Duration::from_millis(1);
const RING_WAIT_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct DbOptions {
    pub in_memory: bool,
    /// Open this image instead of a file; implies read-only.
    pub buffer: Option<Vec<u8>>,
    /// 64-byte key enabling at-rest encryption.
    pub encryption_key: Option<Vec<u8>>,
}

struct Listener {
    id: u64,
    f: Box<dyn Fn(u64) + Send + Sync>,
}

pub struct DB {
    alloc: Arc<SlabAlloc>,
    control: Mutex<ControlRegion>,
    write_owner: Mutex<bool>,
    write_cv: Condvar,
    /// Second descriptor on the database file, used for the cross-process
    /// writer lock.
    wlock: Option<File>,
    note: Option<Mutex<File>>,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    notifier_stop: Arc<AtomicBool>,
    notifier_join: Mutex<Option<std::thread::JoinHandle<()>>>,
    read_only: bool,
    path: Option<PathBuf>,
}

impl DB {
    pub fn open(path: Option<&Path>, options: DbOptions) -> Result<Arc<DB>> {
        let cipher = match &options.encryption_key {
            Some(key) => Some(PageCipher::new(key)?),
            None => None,
        };

        let (map, read_only) = if let Some(buffer) = options.buffer {
            (FileMap::from_buffer(buffer)?, true)
        } else if options.in_memory || path.is_none() {
            (FileMap::new_mem()?, false)
        } else {
            let path = path.expect("checked above");
            match cipher {
                Some(cipher) => (FileMap::open_encrypted(path, cipher)?, false),
                None => (FileMap::open_file(path)?, false),
            }
        };

        let top_ref = map.header()?.current_top_ref();
        let alloc = Arc::new(SlabAlloc::new(map));
        let group = Group::attach(&*alloc, top_ref)?;
        let logical = group.logical_size.max(FILE_HEADER_SIZE as u64);
        alloc.replace_free_list(FreeList::from_parts(
            &group.free_parts.0,
            &group.free_parts.1,
            &group.free_parts.2,
        ));

        let file_backed = !options.in_memory && path.is_some() && !read_only;
        let seed = (group.version, top_ref, logical);
        let (control, wlock, note) = if file_backed {
            let path = path.expect("file backed");

            // The notification file doubles as the session marker: every
            // live session holds a shared lock on it, so an opener that can
            // take it exclusively knows any reader counts in the control
            // region are leftovers from a crash.
            let note_path = sibling_path(path, "note");
            let note = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&note_path)
                .map_err(|e| {
                    err(ErrorKind::FileAccess(format!(
                        "failed to create notification file '{}': {}",
                        note_path.display(),
                        e
                    )))
                })?;
            let first_session = note.try_lock_exclusive().is_ok();

            let lock_path = sibling_path(path, "lock");
            let control = ControlRegion::open(&lock_path, seed, first_session)?;

            // Converts an exclusive hold to shared in place; otherwise
            // blocks briefly on another opener mid-initialization.
            note.lock_shared()
                .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;

            let wlock = OpenOptions::new().read(true).open(path).map_err(|e| {
                err(ErrorKind::FileAccess(format!(
                    "failed to reopen '{}' for write locking: {}",
                    path.display(),
                    e
                )))
            })?;
            (control, Some(wlock), Some(Mutex::new(note)))
        } else {
            (ControlRegion::new_mem(seed), None, None)
        };

        let db = Arc::new(DB {
            alloc,
            control: Mutex::new(control),
            write_owner: Mutex::new(false),
            write_cv: Condvar::new(),
            wlock,
            note,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            notifier_stop: Arc::new(AtomicBool::new(false)),
            notifier_join: Mutex::new(None),
            read_only,
            path: path.map(|p| p.to_owned()),
        });

        if file_backed {
            spawn_notifier(&db);
        }
        tracing::debug!(
            path = ?db.path,
            version = group.version,
            "opened database"
        );
        Ok(db)
    }

    pub fn alloc(&self) -> &Arc<SlabAlloc> {
        &self.alloc
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn newest_version(&self) -> u64 {
        self.control.lock().newest().version
    }

    pub(crate) fn pin_version(&self) -> Result<VersionInfo> {
        self.control.lock().pin_newest()
    }

    pub(crate) fn unpin_version(&self, slot: usize) {
        let _ = self.control.lock().unpin(slot);
    }

    /// Blocks until this handle owns the write side, in-process and
    /// cross-process.
    pub(crate) fn acquire_write(&self) -> Result<()> {
        if self.read_only {
            return Err(err(ErrorKind::InvalidTransaction(
                "database is read-only".into(),
            )));
        }
        let mut owned = self.write_owner.lock();
        while *owned {
            self.write_cv.wait(&mut owned);
        }
        *owned = true;
        drop(owned);

        if let Some(f) = &self.wlock {
            if let Err(e) = f.lock_exclusive() {
                let mut owned = self.write_owner.lock();
                *owned = false;
                self.write_cv.notify_one();
                return Err(err(ErrorKind::FileAccess(format!(
                    "failed to take write lock: {}",
                    e
                ))));
            }
        }
        Ok(())
    }

    pub(crate) fn release_write(&self) {
        if let Some(f) = &self.wlock {
            let _ = FileExt::unlock(f);
        }
        let mut owned = self.write_owner.lock();
        *owned = false;
        self.write_cv.notify_one();
    }

    /// Reclaimable free blocks for a beginning write transaction.
    pub(crate) fn take_reclaimable(&self) -> Result<Vec<crate::alloc::FreeBlock>> {
        let oldest = self.control.lock().oldest_live_version()?;
        Ok(self.alloc.with_free_list(|fl| fl.take_reclaimable(oldest)))
    }

    /// Returns unconsumed reclaimable blocks after a rollback.
    pub(crate) fn return_reclaimable(&self, blocks: Vec<crate::alloc::FreeBlock>) {
        self.alloc.with_free_list(|fl| fl.extend(blocks));
    }

    /// Waits (bounded) for a free ring slot; warns when long-lived readers
    /// hold the ring.
    fn wait_for_ring_slot(&self) -> Result<()> {
        let mut waited = Duration::ZERO;
        let mut warned = false;
        loop {
            let pinned = self.control.lock().pinned_count()?;
            if pinned + 1 < control::RING_SIZE {
                return Ok(());
            }
            if !warned {
                tracing::warn!("version ring is full: a long-lived reader is blocking commits");
                warned = true;
            }
            if waited >= RING_WAIT_LIMIT {
                return Err(err(ErrorKind::LogicError(
                    "version ring exhausted: too many pinned readers".into(),
                )));
            }
            std::thread::sleep(RING_WAIT_STEP);
            waited += RING_WAIT_STEP;
        }
    }

    /// Publishes a write transaction. `changesets` holds the replication
    /// streams to record for the new version (one concatenated entry).
    pub(crate) fn commit_write(
        &self,
        group: &mut Group,
        mut walloc: crate::alloc::WriteAlloc,
        changesets: Vec<Vec<u8>>,
    ) -> Result<u64> {
        self.wait_for_ring_slot()?;
        let new_version = group.version + 1;

        let mut blob = Vec::new();
        for cs in &changesets {
            blob.extend_from_slice(cs);
        }
        crate::repl::history::append_changeset(&mut walloc, group, new_version, &blob)?;
        group.free_previous_top(&mut walloc)?;

        // Free-list bookkeeping: everything this transaction freed out of
        // committed versions becomes reclaimable once no reader can see
        // the pre-commit state. The persisted list is authoritative across
        // instances; this transaction reloaded it at begin-write.
        let mut freed = walloc.drain_freed();
        for b in &mut freed {
            b.version = new_version;
        }
        let unused = walloc.drain_reusable();
        let parts = self.alloc.with_free_list(|fl| {
            fl.extend(freed.iter().copied());
            fl.extend(unused.iter().copied());
            fl.to_parts()
        });

        let top_ref = group.flush(&mut walloc, new_version, parts)?;
        let logical = walloc.logical_size();
        group.patch_logical_size(&mut walloc, logical)?;

        let base = walloc.base();
        let (tail, shadow, late_freed, _) = walloc.into_commit_parts();
        let map = self.alloc.map();
        map.ensure_capacity(logical)?;
        for (r, buf) in shadow {
            map.write_at(r, &buf)?;
        }
        if !tail.is_empty() {
            map.write_at(base, &tail)?;
        }
        map.flush()?;
        map.publish_top_ref(top_ref, self.path.is_some())?;

        self.control.lock().publish(new_version, top_ref, logical)?;

        // Nothing frees after the list is persisted; anything that slipped
        // through joins the in-memory list and the persisted one next
        // commit.
        debug_assert!(late_freed.is_empty());
        self.alloc.with_free_list(|fl| {
            fl.extend(late_freed.into_iter().map(|mut b| {
                b.version = new_version;
                b
            }))
        });

        self.bump_note(new_version);
        tracing::debug!(version = new_version, "committed write transaction");
        Ok(new_version)
    }

    fn bump_note(&self, version: u64) {
        if let Some(note) = &self.note {
            let mut f = note.lock();
            let _ = f
                .seek(SeekFrom::Start(0))
                .and_then(|_| f.write_all(&version.to_le_bytes()))
                .and_then(|_| f.flush());
        }
    }

    pub fn register_listener(&self, f: Box<dyn Fn(u64) + Send + Sync>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, f });
        id
    }

    pub fn unregister_listener(&self, id: u64) {
        self.listeners.lock().retain(|l| l.id != id);
    }

    /// Copies the byte image of a pinned version, with the header rewritten
    /// to select that version's top ref. The result opens as a read-only
    /// in-memory database.
    pub fn copy_image(&self, top_ref: u64, file_size: u64) -> Result<Vec<u8>> {
        let mut image = self
            .alloc
            .map()
            .slice(0, file_size as usize)?
            .to_vec();
        let header = {
            let mut h = crate::alloc::FileHeader::new_empty();
            h.set_top_ref_both(top_ref);
            h
        };
        image[..FILE_HEADER_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        Ok(image)
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.notifier_stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.notifier_join.get_mut().take() {
            // The notifier itself may hold the last reference; it exits on
            // its own once the weak upgrade fails.
            if join.thread().id() != std::thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn spawn_notifier(db: &Arc<DB>) {
    let weak: Weak<DB> = Arc::downgrade(db);
    let stop = db.notifier_stop.clone();
    let note_path = sibling_path(db.path.as_ref().expect("file backed"), "note");
    let mut last_seen = db.newest_version();

    let join = std::thread::Builder::new()
        .name("clusterdb-notifier".into())
        .spawn(move || loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(NOTE_POLL_INTERVAL);
            let Some(db) = weak.upgrade() else { return };
            let mut raw = [0u8; 8];
            let version = File::open(&note_path)
                .and_then(|mut f| f.read_exact(&mut raw).map(|_| u64::from_le_bytes(raw)))
                .unwrap_or(0);
            if version > last_seen {
                last_seen = version;
                for listener in db.listeners.lock().iter() {
                    (listener.f)(version);
                }
            }
        })
        .expect("failed to spawn notifier thread");
    *db.notifier_join.lock() = Some(join);
}
