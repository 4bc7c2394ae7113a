//! # Shared Realm
//!
//! The configuration-driven façade over the storage core: opens a database
//! with a desired schema, runs migrations, arbitrates cached instances per
//! (path, execution context), and delivers change notifications to an
//! installed binding context.
//!
//! ## Instance Cache
//!
//! `Realm::open` returns the same `Arc` for the same path and execution
//! context while a previous instance is alive (unless `cache` is off). An
//! execution context is an opaque identifier grouping accessors that may be
//! used together; without one, the opening thread is the context and use
//! from another thread fails with `IncorrectThread`. The keyed cache and
//! the live-instance list are the only module-scope state in the crate,
//! each behind one lock, dropped entry by entry as realms die.
//!
//! ## Config Agreement
//!
//! While any instance is open on a path, later opens must agree with it on
//! schema version, schema, schema mode, durability and encryption;
//! disagreement fails with `ConfigMismatch`.
//!
//! ## Notifications
//!
//! A commit through this realm calls `did_change` on the binding context
//! synchronously. Commits by any other instance (same or another process)
//! arrive asynchronously through the database's notification file and
//! advance this realm's read transaction before `did_change` fires.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::db::transaction::Transaction;
use crate::db::{DbOptions, DB};
use crate::error::{err, kind_of, ErrorKind};
use crate::schema::migration::{
    changes_require_migration, check_mode_allows, get_schema_version, migrate_schema,
    required_changes, set_schema_version, SchemaMode,
};
use crate::schema::{schema_from_transaction, Schema, NOT_VERSIONED};

pub type MigrationFunction =
    Arc<dyn Fn(&Transaction, &Transaction) -> Result<()> + Send + Sync>;

/// Host-binding hook for change notification.
pub trait BindingContext: Send + Sync {
    /// Called after this realm's data changed: synchronously for a local
    /// commit, asynchronously for a commit made through another instance.
    fn did_change(&self);

    /// Called when new versions exist that this realm has not yet
    /// advanced to.
    fn changes_available(&self) {}
}

#[derive(Clone, Default)]
pub struct RealmConfig {
    pub path: Option<PathBuf>,
    /// Byte image to open as a read-only in-memory realm.
    pub realm_data: Option<Vec<u8>>,
    pub encryption_key: Option<Vec<u8>>,
    pub schema: Option<Schema>,
    /// Required whenever `schema` is supplied.
    pub schema_version: Option<u64>,
    pub schema_mode: SchemaMode,
    pub migration_function: Option<MigrationFunction>,
    pub in_memory: bool,
    /// Return the same instance per (path, execution context). On by
    /// default.
    pub cache: Option<bool>,
    /// Opaque id making accessors shareable across threads.
    pub execution_context: Option<u64>,
}

impl std::fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmConfig")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .field("schema_mode", &self.schema_mode)
            .field("in_memory", &self.in_memory)
            .field("cache", &self.cache)
            .field("execution_context", &self.execution_context)
            .finish()
    }
}

impl RealmConfig {
    fn cache_enabled(&self) -> bool {
        self.cache.unwrap_or(true)
    }

    fn schema_version_or_sentinel(&self) -> u64 {
        self.schema_version.unwrap_or(NOT_VERSIONED)
    }

    fn validate(&self) -> Result<()> {
        if let Some(key) = &self.encryption_key {
            if key.len() != crate::crypto::KEY_SIZE {
                return Err(err(ErrorKind::ConfigInvalid(format!(
                    "encryption key must be {} bytes, got {}",
                    crate::crypto::KEY_SIZE,
                    key.len()
                ))));
            }
        }
        if self.schema.is_some() && self.schema_version.is_none() {
            return Err(err(ErrorKind::ConfigInvalid(
                "a schema requires a schema version".into(),
            )));
        }
        if self.migration_function.is_some() && !self.schema_mode.allows_callback() {
            return Err(err(ErrorKind::ConfigInvalid(format!(
                "a migration function is not allowed in {:?} mode",
                self.schema_mode
            ))));
        }
        if self.realm_data.is_some() {
            if self.path.is_some() || self.in_memory {
                return Err(err(ErrorKind::ConfigInvalid(
                    "realm_data cannot be combined with a path or in_memory".into(),
                )));
            }
            if !self.schema_mode.is_read_only() {
                return Err(err(ErrorKind::ConfigInvalid(
                    "realm_data requires a read-only schema mode".into(),
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ContextId {
    Thread(ThreadId),
    Explicit(u64),
}

impl ContextId {
    fn current(execution_context: Option<u64>) -> ContextId {
        match execution_context {
            Some(id) => ContextId::Explicit(id),
            None => ContextId::Thread(std::thread::current().id()),
        }
    }
}

pub struct Realm {
    config: RealmConfig,
    db: Arc<DB>,
    txn: Mutex<Option<Transaction>>,
    binding: Mutex<Option<Box<dyn BindingContext>>>,
    closed: AtomicBool,
    context: ContextId,
    db_listener: Mutex<Option<u64>>,
}

type CacheMap = HashMap<(PathBuf, ContextId), Weak<Realm>>;
type LiveList = Vec<Weak<Realm>>;

fn cache() -> &'static Mutex<CacheMap> {
    static CACHE: OnceLock<Mutex<CacheMap>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn live_realms() -> &'static Mutex<LiveList> {
    static LIVE: OnceLock<Mutex<LiveList>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(Vec::new()))
}

impl Realm {
    /// Opens (or returns the cached) realm for a configuration.
    pub fn open(config: RealmConfig) -> Result<Arc<Realm>> {
        config.validate()?;
        let context = ContextId::current(config.execution_context);

        if let Some(path) = &config.path {
            check_config_against_live(path, &config)?;
            if config.cache_enabled() {
                let key = (path.clone(), context);
                if let Some(existing) = cache().lock().get(&key).and_then(Weak::upgrade) {
                    return Ok(existing);
                }
            }
        }

        if config.schema_mode == SchemaMode::ResetFile {
            reset_file_if_needed(&config)?;
        }

        let db = DB::open(
            config.path.as_deref(),
            DbOptions {
                in_memory: config.in_memory,
                buffer: config.realm_data.clone(),
                encryption_key: config.encryption_key.clone(),
            },
        )?;

        update_schema_at_open(&db, &config)?;

        let realm = Arc::new(Realm {
            txn: Mutex::new(Some(Transaction::begin_read(&db)?)),
            db,
            binding: Mutex::new(None),
            closed: AtomicBool::new(false),
            context,
            config,
            db_listener: Mutex::new(None),
        });

        // External-commit delivery: advance and notify asynchronously.
        let weak = Arc::downgrade(&realm);
        let id = realm.db.register_listener(Box::new(move |version| {
            if let Some(realm) = weak.upgrade() {
                realm.on_external_commit(version);
            }
        }));
        *realm.db_listener.lock() = Some(id);

        live_realms().lock().push(Arc::downgrade(&realm));
        if let (Some(path), true) = (&realm.config.path, realm.config.cache_enabled()) {
            cache()
                .lock()
                .insert((path.clone(), context), Arc::downgrade(&realm));
        }
        Ok(realm)
    }

    pub fn config(&self) -> &RealmConfig {
        &self.config
    }

    /// Fails when called from a different execution context than the one
    /// the realm was opened under.
    pub fn verify_thread(&self) -> Result<()> {
        match self.context {
            ContextId::Explicit(_) => Ok(()),
            ContextId::Thread(id) => {
                if std::thread::current().id() == id {
                    Ok(())
                } else {
                    Err(err(ErrorKind::IncorrectThread))
                }
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(err(ErrorKind::Closed));
        }
        self.verify_thread()
    }

    /// Runs a closure against the realm's current read transaction.
    pub fn read<R>(&self, f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
        self.check_open()?;
        let mut guard = self.txn.lock();
        if guard.is_none() {
            *guard = Some(Transaction::begin_read(&self.db)?);
        }
        f(guard.as_ref().expect("populated above"))
    }

    /// The schema persisted in the realm's current snapshot.
    pub fn schema(&self) -> Result<Schema> {
        self.read(schema_from_transaction)
    }

    pub fn schema_version(&self) -> Result<u64> {
        self.read(get_schema_version)
    }

    pub fn is_in_transaction(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.txn
            .lock()
            .as_ref()
            .map(|t| t.is_write())
            .unwrap_or(false)
    }

    pub fn begin_transaction(&self) -> Result<()> {
        self.check_open()?;
        if self.config.schema_mode.is_read_only() {
            return Err(err(ErrorKind::InvalidTransaction(
                "cannot write to a read-only realm".into(),
            )));
        }
        let mut guard = self.txn.lock();
        if guard.is_none() {
            *guard = Some(Transaction::begin_read(&self.db)?);
        }
        let txn = guard.as_mut().expect("populated above");
        if txn.is_write() {
            return Err(err(ErrorKind::InvalidTransaction(
                "a write transaction is already active".into(),
            )));
        }
        txn.promote_to_write()
    }

    /// Commits the active write transaction and delivers the synchronous
    /// `did_change`.
    pub fn commit_transaction(&self) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(err(ErrorKind::InvalidTransaction(
                "no write transaction on a closed realm".into(),
            )));
        }
        self.verify_thread()?;
        let mut guard = self.txn.lock();
        let Some(txn) = guard.take() else {
            return Err(err(ErrorKind::InvalidTransaction(
                "commit without a write transaction".into(),
            )));
        };
        if !txn.is_write() {
            *guard = Some(txn);
            return Err(err(ErrorKind::InvalidTransaction(
                "commit without a write transaction".into(),
            )));
        }
        let version = txn.commit()?;
        *guard = Some(Transaction::begin_read(&self.db)?);
        drop(guard);

        if let Some(binding) = self.binding.lock().as_ref() {
            binding.did_change();
        }
        Ok(version)
    }

    pub fn cancel_transaction(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(err(ErrorKind::InvalidTransaction(
                "no write transaction on a closed realm".into(),
            )));
        }
        self.verify_thread()?;
        let mut guard = self.txn.lock();
        let Some(txn) = guard.as_mut() else {
            return Err(err(ErrorKind::InvalidTransaction(
                "cancel without a write transaction".into(),
            )));
        };
        if !txn.is_write() {
            return Err(err(ErrorKind::InvalidTransaction(
                "cancel without a write transaction".into(),
            )));
        }
        txn.demote_to_read()
    }

    /// Convenience: one write transaction around a closure.
    pub fn write<R>(&self, f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
        self.begin_transaction()?;
        let result = {
            let guard = self.txn.lock();
            f(guard.as_ref().expect("write transaction active"))
        };
        match result {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.cancel_transaction();
                Err(e)
            }
        }
    }

    /// Advances the read transaction to the newest version. Returns whether
    /// anything changed.
    pub fn refresh(&self) -> Result<bool> {
        self.check_open()?;
        let mut guard = self.txn.lock();
        if guard.is_none() {
            *guard = Some(Transaction::begin_read(&self.db)?);
            return Ok(true);
        }
        let txn = guard.as_ref().expect("populated above");
        if txn.is_write() {
            return Ok(false);
        }
        let before = txn.version();
        let after = txn.advance_read()?;
        Ok(after > before)
    }

    /// Delivers pending external changes (also called by the notifier).
    pub fn notify(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(err(ErrorKind::Closed));
        }
        let newest = self.db.newest_version();
        let current = self.txn.lock().as_ref().map(|t| t.version()).unwrap_or(0);
        if newest > current {
            if let Some(binding) = self.binding.lock().as_ref() {
                binding.changes_available();
            }
            if self.refresh_from_notifier()? {
                if let Some(binding) = self.binding.lock().as_ref() {
                    binding.did_change();
                }
            }
        }
        Ok(())
    }

    /// Drops the read pin; the next access re-pins the newest version.
    pub fn invalidate(&self) -> Result<()> {
        self.check_open()?;
        let mut guard = self.txn.lock();
        if guard.as_ref().map(|t| t.is_write()).unwrap_or(false) {
            return Err(err(ErrorKind::InvalidTransaction(
                "cannot invalidate during a write transaction".into(),
            )));
        }
        *guard = None;
        Ok(())
    }

    /// Serializes the current version as a buffer openable through
    /// `realm_data`.
    pub fn write_copy_to_mem(&self) -> Result<Vec<u8>> {
        self.read(|txn| txn.write_copy_to_mem())
    }

    pub fn set_binding_context(&self, binding: Box<dyn BindingContext>) {
        *self.binding.lock() = Some(binding);
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.db_listener.lock().take() {
            self.db.unregister_listener(id);
        }
        *self.txn.lock() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn refresh_from_notifier(&self) -> Result<bool> {
        // Same as refresh, minus the thread check: delivery happens on the
        // notifier thread on the owner's behalf.
        let mut guard = self.txn.lock();
        match guard.as_ref() {
            None => {
                *guard = Some(Transaction::begin_read(&self.db)?);
                Ok(true)
            }
            Some(txn) if txn.is_write() => Ok(false),
            Some(txn) => {
                let before = txn.version();
                let after = txn.advance_read()?;
                Ok(after > before)
            }
        }
    }

    fn on_external_commit(&self, _version: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.notify();
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        self.close();
        live_realms().lock().retain(|w| w.strong_count() > 0);
        cache().lock().retain(|_, w| w.strong_count() > 0);
    }
}

/// Opening a path must agree with every live instance on it.
fn check_config_against_live(path: &PathBuf, config: &RealmConfig) -> Result<()> {
    let live: Vec<Arc<Realm>> = {
        let mut list = live_realms().lock();
        list.retain(|w| w.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    };
    for other in live {
        if other.config.path.as_ref() != Some(path) || other.is_closed() {
            continue;
        }
        let theirs = &other.config;
        if config.in_memory != theirs.in_memory {
            return Err(err(ErrorKind::ConfigMismatch(
                "durability differs from the open instance".into(),
            )));
        }
        if config.schema_mode != theirs.schema_mode {
            return Err(err(ErrorKind::ConfigMismatch(
                "schema mode differs from the open instance".into(),
            )));
        }
        if config.encryption_key != theirs.encryption_key {
            return Err(err(ErrorKind::ConfigMismatch(
                "encryption key differs from the open instance".into(),
            )));
        }
        if let (Some(version), Some(their_version)) =
            (config.schema_version, theirs.schema_version)
        {
            if version != their_version {
                return Err(err(ErrorKind::ConfigMismatch(
                    "schema version differs from the open instance".into(),
                )));
            }
        }
        if let (Some(schema), Some(their_schema)) = (&config.schema, &theirs.schema) {
            if !required_changes(their_schema, schema).is_empty()
                || !required_changes(schema, their_schema).is_empty()
            {
                return Err(err(ErrorKind::ConfigMismatch(
                    "schema differs from the open instance".into(),
                )));
            }
        }
    }
    Ok(())
}

/// ResetFile: discard the file when the persisted state disagrees with the
/// desired schema or version.
fn reset_file_if_needed(config: &RealmConfig) -> Result<()> {
    let Some(path) = &config.path else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }
    let needs_reset = {
        let db = DB::open(
            Some(path.as_path()),
            DbOptions {
                encryption_key: config.encryption_key.clone(),
                ..Default::default()
            },
        )?;
        let txn = Transaction::begin_read(&db)?;
        let persisted = schema_from_transaction(&txn)?;
        let version = get_schema_version(&txn)?;
        match &config.schema {
            Some(schema) => {
                !required_changes(&persisted, schema).is_empty()
                    || version != config.schema_version_or_sentinel()
            }
            None => false,
        }
    };
    if needs_reset {
        tracing::debug!(path = %path.display(), "resetting database file");
        std::fs::remove_file(path).map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
        for suffix in ["lock", "note"] {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".");
            name.push(suffix);
            let _ = std::fs::remove_file(path.with_file_name(name));
        }
    }
    Ok(())
}

/// Reconciles the persisted schema with the configured one at open time.
fn update_schema_at_open(db: &Arc<DB>, config: &RealmConfig) -> Result<()> {
    let Some(desired) = &config.schema else {
        return Ok(());
    };
    desired.validate()?;
    let desired_version = config.schema_version_or_sentinel();

    let read = Transaction::begin_read(db)?;
    let persisted = schema_from_transaction(&read)?;
    let persisted_version = get_schema_version(&read)?;
    let changes = required_changes(&persisted, desired);

    if config.schema_mode.is_read_only() {
        if !changes.is_empty() {
            return Err(err(ErrorKind::SchemaValidation(
                "schema does not match the file in a read-only open".into(),
            )));
        }
        return Ok(());
    }

    if persisted_version != NOT_VERSIONED && desired_version < persisted_version {
        return Err(err(ErrorKind::SchemaValidation(format!(
            "schema version {} is below the persisted version {}",
            desired_version, persisted_version
        ))));
    }
    check_mode_allows(config.schema_mode, &changes)?;

    let version_changed = persisted_version != desired_version;
    if changes.is_empty() && !version_changed {
        return Ok(());
    }

    if changes_require_migration(&changes)
        && config.schema_mode == SchemaMode::Manual
        && persisted_version != NOT_VERSIONED
        && config.migration_function.is_none()
    {
        return Err(err(ErrorKind::SchemaValidation(
            "destructive schema changes require a migration function".into(),
        )));
    }

    drop(read);
    let write = Transaction::begin_write(db)?;
    migrate_schema(&write, desired, config.schema_mode)?;

    // Invoke the callback on a version bump of an existing file: the old
    // state through a pinned read transaction, the new through the write.
    let run_callback = config.migration_function.is_some()
        && persisted_version != NOT_VERSIONED
        && version_changed;
    if run_callback {
        let old = Transaction::begin_read(db)?;
        let callback = config.migration_function.as_ref().expect("checked above");
        if let Err(e) = callback(&old, &write) {
            write.rollback();
            let message = e.to_string();
            if matches!(kind_of(&e), Some(ErrorKind::Migration(_))) {
                return Err(e);
            }
            return Err(err(ErrorKind::Migration(message)));
        }
    }

    set_schema_version(&write, desired_version)?;
    write.commit()?;
    tracing::debug!(version = desired_version, "schema updated");
    Ok(())
}
