//! # Transactions
//!
//! A [`Transaction`] pins one version of the database. Read transactions
//! observe an immutable snapshot; a write transaction additionally owns the
//! write side of the file, a transaction allocator for its new slabs, and
//! the replication sink recording its changeset.
//!
//! ## Accessors
//!
//! [`Table`], [`Obj`] and [`Lst`] are lightweight handles borrowing the
//! transaction, so the borrow checker retires every accessor when the
//! transaction commits or rolls back (both consume it). Internal state is
//! behind a mutex, which keeps the handles cheap to copy and lets the
//! notifier thread advance a realm's read transaction.
//!
//! ## Lifecycle
//!
//! ```text
//! begin_read ──► Read ──promote_to_write──► Write ──commit──► (consumed)
//!                 ▲                           │
//!                 └──────demote_to_read───────┘ ──rollback──► (consumed)
//! ```
//!
//! Rollback simply drops the transaction allocator; no committed state is
//! touched.

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::alloc::{Allocator, SlabAlloc, WriteAlloc, FILE_HEADER_SIZE};
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::repl::{apply::apply_changeset, history, TransactLog};
use crate::table::index::{indexable, set_search_index, SearchIndexes};
use crate::table::spec::{ColumnSpec, ColumnType, ATTR_LIST, ATTR_NULLABLE, ATTR_STRONG_LINKS};
use crate::table::{self, fields, lists};
use crate::value::{ColKey, ObjKey, TableKey, Value};

use super::DB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Read,
    Write,
    Closed,
}

struct WriteState {
    alloc: WriteAlloc,
    repl: Option<TransactLog>,
    /// Remote changesets applied in this transaction; recorded in history
    /// alongside the local log.
    applied: Vec<Vec<u8>>,
}

struct TxnInner {
    stage: Stage,
    version: u64,
    top_ref: u64,
    file_size: u64,
    slot: Option<usize>,
    group: Group,
    write: Option<WriteState>,
    indexes: SearchIndexes,
}

pub struct Transaction {
    db: Arc<DB>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub fn begin_read(db: &Arc<DB>) -> Result<Transaction> {
        let pin = db.pin_version()?;
        let group = Group::attach(&**db.alloc(), pin.top_ref)?;
        Ok(Transaction {
            db: db.clone(),
            inner: Mutex::new(TxnInner {
                stage: Stage::Read,
                version: pin.version,
                top_ref: pin.top_ref,
                file_size: pin.file_size.max(FILE_HEADER_SIZE as u64),
                slot: Some(pin.slot),
                group,
                write: None,
                indexes: SearchIndexes::new(),
            }),
        })
    }

    pub fn begin_write(db: &Arc<DB>) -> Result<Transaction> {
        let mut txn = Self::begin_read(db)?;
        txn.promote_to_write()?;
        Ok(txn)
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn is_write(&self) -> bool {
        self.inner.lock().stage == Stage::Write
    }

    /// Moves a read transaction to the newest committed version.
    pub fn advance_read(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Read {
            return Err(err(ErrorKind::InvalidTransaction(
                "advance requires a read transaction".into(),
            )));
        }
        let pin = self.db.pin_version()?;
        if let Some(old) = inner.slot.take() {
            self.db.unpin_version(old);
        }
        inner.version = pin.version;
        inner.top_ref = pin.top_ref;
        inner.file_size = pin.file_size.max(FILE_HEADER_SIZE as u64);
        inner.slot = Some(pin.slot);
        inner.group = Group::attach(&**self.db.alloc(), pin.top_ref)?;
        inner.indexes.invalidate_all();
        Ok(pin.version)
    }

    pub fn promote_to_write(&mut self) -> Result<()> {
        {
            let inner = self.inner.lock();
            match inner.stage {
                Stage::Read => {}
                Stage::Write => {
                    return Err(err(ErrorKind::InvalidTransaction(
                        "transaction is already writing".into(),
                    )))
                }
                Stage::Closed => return Err(err(ErrorKind::Closed)),
            }
        }
        self.db.acquire_write()?;

        let mut inner = self.inner.lock();
        // Re-pin at the newest version now that we own the write side.
        let pin = match self.db.pin_version() {
            Ok(pin) => pin,
            Err(e) => {
                self.db.release_write();
                return Err(e);
            }
        };
        if let Some(old) = inner.slot.take() {
            self.db.unpin_version(old);
        }
        inner.version = pin.version;
        inner.top_ref = pin.top_ref;
        inner.file_size = pin.file_size.max(FILE_HEADER_SIZE as u64);
        inner.slot = Some(pin.slot);
        inner.group = Group::attach(&**self.db.alloc(), pin.top_ref)?;
        inner.indexes.invalidate_all();

        // The snapshot's persisted free list is the source of truth: another
        // instance may have consumed or extended it since this handle
        // opened. The write lock is held, so the snapshot is the newest.
        self.db
            .alloc()
            .replace_free_list(crate::alloc::FreeList::from_parts(
                &inner.group.free_parts.0,
                &inner.group.free_parts.1,
                &inner.group.free_parts.2,
            ));
        let reclaimable = self.db.take_reclaimable()?;
        inner.write = Some(WriteState {
            alloc: WriteAlloc::new(self.db.alloc().clone(), inner.file_size, reclaimable),
            repl: Some(TransactLog::new()),
            applied: Vec::new(),
        });
        inner.stage = Stage::Write;
        Ok(())
    }

    pub fn demote_to_read(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Write {
            return Err(err(ErrorKind::InvalidTransaction(
                "transaction is not writing".into(),
            )));
        }
        let state = inner.write.take().expect("write stage has state");
        let mut walloc = state.alloc;
        self.db.return_reclaimable(walloc.drain_reusable());
        self.db.release_write();
        // Discard the dirty group; the pinned snapshot stays authoritative.
        inner.group = Group::attach(&**self.db.alloc(), inner.top_ref)?;
        inner.indexes.invalidate_all();
        inner.stage = Stage::Read;
        Ok(())
    }

    /// Publishes the write transaction, returning the new version number.
    pub fn commit(self) -> Result<u64> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.stage != Stage::Write {
                return Err(err(ErrorKind::InvalidTransaction(
                    "commit requires a write transaction".into(),
                )));
            }
            let state = inner.write.take().expect("write stage has state");
            let mut changesets = Vec::with_capacity(1 + state.applied.len());
            if let Some(log) = state.repl {
                changesets.push(log.into_bytes());
            }
            changesets.extend(state.applied);

            let TxnInner { group, .. } = &mut *inner;
            let pre_version = group.version;
            let result = self.db.commit_write(group, state.alloc, changesets);
            if result.is_err() {
                // The failed commit may have tagged frees with its version;
                // those blocks are still live in the surviving version.
                self.db.alloc().with_free_list(|fl| {
                    fl.purge_version(pre_version + 1);
                    fl.purge_version(group.version + 1);
                });
            }
            self.db.release_write();
            inner.stage = Stage::Closed;
            if let Some(slot) = inner.slot.take() {
                self.db.unpin_version(slot);
            }
            result
        };
        result
    }

    /// Abandons the transaction. For a write transaction every new slab is
    /// simply dropped; no partial effect is observable.
    pub fn rollback(self) {
        self.teardown();
    }

    fn teardown(&self) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.write.take() {
            let mut walloc = state.alloc;
            self.db.return_reclaimable(walloc.drain_reusable());
            self.db.release_write();
        }
        if let Some(slot) = inner.slot.take() {
            self.db.unpin_version(slot);
        }
        inner.stage = Stage::Closed;
    }

    // --- internal plumbing -------------------------------------------------

    fn with_read<R>(&self, f: impl FnOnce(&dyn Allocator, &Group) -> Result<R>) -> Result<R> {
        let inner = self.inner.lock();
        if inner.stage == Stage::Closed {
            return Err(err(ErrorKind::Closed));
        }
        let db_alloc: &SlabAlloc = &**self.db.alloc();
        match &inner.write {
            Some(state) => f(&state.alloc, &inner.group),
            None => f(db_alloc, &inner.group),
        }
    }

    fn with_write<R>(
        &self,
        f: impl FnOnce(&mut WriteAlloc, &mut Group, &mut Option<TransactLog>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        match inner.stage {
            Stage::Write => {}
            Stage::Read => {
                return Err(err(ErrorKind::InvalidTransaction(
                    "mutation outside a write transaction".into(),
                )))
            }
            Stage::Closed => return Err(err(ErrorKind::Closed)),
        }
        let TxnInner {
            group,
            write,
            indexes,
            ..
        } = &mut *inner;
        indexes.invalidate_all();
        let state = write.as_mut().expect("write stage has state");
        f(&mut state.alloc, group, &mut state.repl)
    }

    // --- group-level operations --------------------------------------------

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.with_read(|_, group| {
            Ok(group
                .table_keys()
                .into_iter()
                .filter_map(|k| group.table_name(k).ok().map(|n| n.to_owned()))
                .collect())
        })
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.with_read(|_, group| Ok(group.find_table(name).is_some()))
    }

    pub fn get_table(&self, name: &str) -> Result<Option<Table<'_>>> {
        let key = self.with_read(|_, group| Ok(group.find_table(name)))?;
        Ok(key.map(|key| Table { txn: self, key }))
    }

    pub fn table(&self, key: TableKey) -> Result<Table<'_>> {
        self.with_read(|_, group| {
            group.table_top(key)?;
            Ok(())
        })?;
        Ok(Table { txn: self, key })
    }

    pub fn add_table(&self, name: &str, embedded: bool) -> Result<Table<'_>> {
        let key = self.with_write(|tx, group, repl| {
            table::create_table(tx, group, repl, name, embedded)
        })?;
        Ok(Table { txn: self, key })
    }

    pub fn get_or_add_table(&self, name: &str) -> Result<Table<'_>> {
        if let Some(table) = self.get_table(name)? {
            return Ok(table);
        }
        self.add_table(name, false)
    }

    pub fn remove_table(&self, name: &str) -> Result<()> {
        self.with_write(|tx, group, repl| {
            let key = group.find_table(name).ok_or_else(|| {
                err(ErrorKind::LogicError(format!("no table named '{}'", name)))
            })?;
            table::remove_table(tx, group, repl, key)
        })
    }

    pub fn rename_table(&self, name: &str, new_name: &str) -> Result<()> {
        self.with_write(|tx, group, repl| {
            let key = group.find_table(name).ok_or_else(|| {
                err(ErrorKind::LogicError(format!("no table named '{}'", name)))
            })?;
            table::rename_table(tx, group, repl, key, new_name)
        })
    }

    /// Integrates a remote changeset: replays it through the local
    /// primitives (recording suppressed) and records the original stream
    /// in this transaction's history entry.
    pub fn apply_changeset(&self, bytes: &[u8]) -> Result<()> {
        self.with_write(|tx, group, _repl| apply_changeset(tx, group, bytes))?;
        let mut inner = self.inner.lock();
        if let Some(state) = inner.write.as_mut() {
            state.applied.push(bytes.to_vec());
        }
        Ok(())
    }

    /// Recorded changesets for versions after `from_version`.
    pub fn changesets_since(&self, from_version: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        self.with_read(|alloc, group| history::changesets_since(alloc, group, from_version))
    }

    /// Serializes this transaction's version as a standalone database
    /// image, suitable for a read-only in-memory open.
    pub fn write_copy_to_mem(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        if inner.stage == Stage::Closed {
            return Err(err(ErrorKind::Closed));
        }
        if inner.stage == Stage::Write {
            return Err(err(ErrorKind::InvalidTransaction(
                "write copy requires a read transaction".into(),
            )));
        }
        self.db.copy_image(inner.top_ref, inner.file_size)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Accessor for one table, borrowed from a transaction.
#[derive(Clone, Copy)]
pub struct Table<'t> {
    txn: &'t Transaction,
    key: TableKey,
}

impl<'t> Table<'t> {
    pub fn key(&self) -> TableKey {
        self.key
    }

    pub fn name(&self) -> Result<String> {
        self.txn
            .with_read(|_, group| Ok(group.table_name(self.key)?.to_owned()))
    }

    pub fn size(&self) -> Result<usize> {
        self.txn
            .with_read(|alloc, group| table::table_size(alloc, group, self.key))
    }

    pub fn is_embedded(&self) -> Result<bool> {
        self.txn.with_read(|alloc, group| {
            Ok(table::load_table(alloc, group, self.key)?.is_embedded())
        })
    }

    pub fn add_column(&self, name: &str, ty: ColumnType, nullable: bool) -> Result<ColKey> {
        let attrs = if nullable { ATTR_NULLABLE } else { 0 };
        self.add_column_with_attrs(name, ty, attrs, None)
    }

    pub fn add_column_list(&self, name: &str, ty: ColumnType, nullable: bool) -> Result<ColKey> {
        let attrs = ATTR_LIST | if nullable { ATTR_NULLABLE } else { 0 };
        self.add_column_with_attrs(name, ty, attrs, None)
    }

    pub fn add_column_link(&self, name: &str, target: TableKey, strong: bool) -> Result<ColKey> {
        let attrs = if strong { ATTR_STRONG_LINKS } else { 0 };
        self.add_column_with_attrs(name, ColumnType::Link, attrs, Some(target))
    }

    pub fn add_column_link_list(
        &self,
        name: &str,
        target: TableKey,
        strong: bool,
    ) -> Result<ColKey> {
        let attrs = ATTR_LIST | if strong { ATTR_STRONG_LINKS } else { 0 };
        self.add_column_with_attrs(name, ColumnType::Link, attrs, Some(target))
    }

    pub fn add_column_with_attrs(
        &self,
        name: &str,
        ty: ColumnType,
        attrs: u8,
        target: Option<TableKey>,
    ) -> Result<ColKey> {
        self.txn.with_write(|tx, group, repl| {
            table::add_column(
                tx,
                group,
                repl,
                self.key,
                ColumnSpec {
                    name: name.to_owned(),
                    ty,
                    attrs,
                    peer_table: target,
                    origin_col: None,
                },
            )
        })
    }

    pub fn remove_column(&self, col: ColKey) -> Result<()> {
        self.txn
            .with_write(|tx, group, repl| table::remove_column(tx, group, repl, self.key, col))
    }

    pub fn rename_column(&self, col: ColKey, new_name: &str) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            table::rename_column(tx, group, repl, self.key, col, new_name)
        })
    }

    pub fn add_search_index(&self, col: ColKey) -> Result<()> {
        self.txn
            .with_write(|tx, group, _| set_search_index(tx, group, self.key, col, true))
    }

    pub fn remove_search_index(&self, col: ColKey) -> Result<()> {
        self.txn
            .with_write(|tx, group, _| set_search_index(tx, group, self.key, col, false))
    }

    pub fn column_count(&self) -> Result<usize> {
        self.txn.with_read(|alloc, group| {
            Ok(table::load_table(alloc, group, self.key)?
                .spec
                .public_column_count())
        })
    }

    pub fn column_key(&self, name: &str) -> Result<Option<ColKey>> {
        self.txn.with_read(|alloc, group| {
            Ok(table::load_table(alloc, group, self.key)?
                .spec
                .find_public(name))
        })
    }

    pub fn column_spec(&self, col: ColKey) -> Result<ColumnSpec> {
        self.txn.with_read(|alloc, group| {
            Ok(table::load_table(alloc, group, self.key)?
                .spec
                .col(col)?
                .clone())
        })
    }

    /// User-visible columns in slot order.
    pub fn columns(&self) -> Result<Vec<(ColKey, ColumnSpec)>> {
        self.txn.with_read(|alloc, group| {
            Ok(table::load_table(alloc, group, self.key)?
                .spec
                .public_columns()
                .map(|(k, c)| (k, c.clone()))
                .collect())
        })
    }

    pub fn create_object(&self) -> Result<Obj<'t>> {
        let key = self.txn.with_write(|tx, group, repl| {
            table::create_object(tx, group, repl, self.key, None)
        })?;
        Ok(Obj {
            txn: self.txn,
            table: self.key,
            key,
        })
    }

    pub fn create_object_with_key(&self, key: ObjKey) -> Result<Obj<'t>> {
        self.txn.with_write(|tx, group, repl| {
            table::create_object(tx, group, repl, self.key, Some(key))
        })?;
        Ok(Obj {
            txn: self.txn,
            table: self.key,
            key,
        })
    }

    /// Finds or creates the object with the given primary-key value.
    pub fn create_object_with_primary_key(&self, pk: Value) -> Result<Obj<'t>> {
        let pk_col = self.txn.with_read(|alloc, group| {
            table::load_table(alloc, group, self.key)?
                .spec
                .primary_key_col()
                .ok_or_else(|| {
                    err(ErrorKind::LogicError(
                        "table has no primary key column".into(),
                    ))
                })
        })?;
        if let Some(existing) = self.find_first(pk_col, &pk)? {
            return Ok(Obj {
                txn: self.txn,
                table: self.key,
                key: existing,
            });
        }
        let obj = self.create_object()?;
        obj.set(pk_col, pk)?;
        Ok(obj)
    }

    pub fn get_object(&self, key: ObjKey) -> Result<Obj<'t>> {
        let exists = self
            .txn
            .with_read(|alloc, group| table::object_exists(alloc, group, self.key, key))?;
        if !exists {
            return Err(err(ErrorKind::LogicError(format!(
                "object key {} does not exist",
                key.0
            ))));
        }
        Ok(Obj {
            txn: self.txn,
            table: self.key,
            key,
        })
    }

    pub fn object_exists(&self, key: ObjKey) -> Result<bool> {
        self.txn
            .with_read(|alloc, group| table::object_exists(alloc, group, self.key, key))
    }

    pub fn remove_object(&self, key: ObjKey) -> Result<()> {
        self.txn
            .with_write(|tx, group, repl| table::remove_object(tx, group, repl, self.key, key))
    }

    /// Removes every object (cascading as usual).
    pub fn clear(&self) -> Result<()> {
        let keys = self.object_keys()?;
        for key in keys {
            if self.object_exists(key)? {
                self.remove_object(key)?;
            }
        }
        Ok(())
    }

    pub fn object_keys(&self) -> Result<Vec<ObjKey>> {
        self.txn.with_read(|alloc, group| {
            let info = table::load_table(alloc, group, self.key)?;
            let mut keys = Vec::new();
            crate::cluster::for_each_key(alloc, info.cluster, &mut |k| {
                keys.push(ObjKey(k));
                Ok(())
            })?;
            Ok(keys)
        })
    }

    pub fn find_first(&self, col: ColKey, value: &Value) -> Result<Option<ObjKey>> {
        let mut inner = self.txn.inner.lock();
        if inner.stage == Stage::Closed {
            return Err(err(ErrorKind::Closed));
        }
        let db_alloc: &SlabAlloc = &**self.txn.db.alloc();
        let TxnInner {
            group,
            write,
            indexes,
            ..
        } = &mut *inner;
        let alloc: &dyn Allocator = match write {
            Some(state) => &state.alloc,
            None => db_alloc,
        };
        let spec = table::load_table(alloc, group, self.key)?.spec;
        let column = spec.col(col)?;
        if column.is_indexed() && indexable(column.ty) {
            indexes.find_first(alloc, group, self.key, col, value)
        } else {
            fields::find_first_scan(alloc, group, self.key, col, value)
        }
    }
}

/// Accessor for one object row.
#[derive(Clone, Copy)]
pub struct Obj<'t> {
    txn: &'t Transaction,
    table: TableKey,
    key: ObjKey,
}

impl<'t> Obj<'t> {
    pub fn key(&self) -> ObjKey {
        self.key
    }

    pub fn table_key(&self) -> TableKey {
        self.table
    }

    pub fn get(&self, col: ColKey) -> Result<Value> {
        self.txn
            .with_read(|alloc, group| fields::obj_get(alloc, group, self.table, self.key, col))
    }

    pub fn get_int(&self, col: ColKey) -> Result<i64> {
        match self.get(col)? {
            Value::Int(v) => Ok(v),
            other => Err(err(ErrorKind::LogicError(format!(
                "expected an integer, found {:?}",
                other
            )))),
        }
    }

    pub fn get_string(&self, col: ColKey) -> Result<String> {
        match self.get(col)? {
            Value::String(s) => Ok(s),
            other => Err(err(ErrorKind::LogicError(format!(
                "expected a string, found {:?}",
                other
            )))),
        }
    }

    pub fn set(&self, col: ColKey, value: Value) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            fields::obj_set(tx, group, repl, self.table, self.key, col, value, false)
        })
    }

    /// Default-population write; recorded as `SetDefault` in the changeset.
    pub fn set_default(&self, col: ColKey, value: Value) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            fields::obj_set(tx, group, repl, self.table, self.key, col, value, true)
        })
    }

    pub fn set_null(&self, col: ColKey) -> Result<()> {
        self.set(col, Value::Null)
    }

    pub fn is_null(&self, col: ColKey) -> Result<bool> {
        self.txn.with_read(|alloc, group| {
            fields::obj_is_null(alloc, group, self.table, self.key, col)
        })
    }

    pub fn add_int(&self, col: ColKey, delta: i64) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            fields::obj_add_int(tx, group, repl, self.table, self.key, col, delta)
        })
    }

    pub fn list(&self, col: ColKey) -> Lst<'t> {
        Lst {
            txn: self.txn,
            table: self.table,
            key: self.key,
            col,
        }
    }

    pub fn backlink_count(&self, origin_table: TableKey, origin_col: ColKey) -> Result<usize> {
        self.txn.with_read(|alloc, group| {
            let info = table::load_table(alloc, group, self.table)?;
            let bl_col = info
                .spec
                .backlink_col_for(origin_table, origin_col)
                .ok_or_else(|| {
                    err(ErrorKind::LogicError(
                        "no backlink column for that origin".into(),
                    ))
                })?;
            table::backlink_count(alloc, &info, self.key, bl_col)
        })
    }

    pub fn backlink(
        &self,
        origin_table: TableKey,
        origin_col: ColKey,
        ndx: usize,
    ) -> Result<ObjKey> {
        self.txn.with_read(|alloc, group| {
            let info = table::load_table(alloc, group, self.table)?;
            let bl_col = info
                .spec
                .backlink_col_for(origin_table, origin_col)
                .ok_or_else(|| {
                    err(ErrorKind::LogicError(
                        "no backlink column for that origin".into(),
                    ))
                })?;
            table::backlink_get(alloc, &info, self.key, bl_col, ndx)
        })
    }

    pub fn remove(self) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            table::remove_object(tx, group, repl, self.table, self.key)
        })
    }
}

/// Accessor for one list cell.
#[derive(Clone, Copy)]
pub struct Lst<'t> {
    txn: &'t Transaction,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
}

impl Lst<'_> {
    pub fn size(&self) -> Result<usize> {
        self.txn.with_read(|alloc, group| {
            lists::list_size(alloc, group, self.table, self.key, self.col)
        })
    }

    pub fn get(&self, ndx: usize) -> Result<Value> {
        self.txn.with_read(|alloc, group| {
            lists::list_get(alloc, group, self.table, self.key, self.col, ndx)
        })
    }

    pub fn insert(&self, ndx: usize, value: Value) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            lists::list_insert(tx, group, repl, self.table, self.key, self.col, ndx, value)
        })
    }

    pub fn push(&self, value: Value) -> Result<()> {
        let n = self.size()?;
        self.insert(n, value)
    }

    pub fn set(&self, ndx: usize, value: Value) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            lists::list_set(tx, group, repl, self.table, self.key, self.col, ndx, value)
        })
    }

    pub fn remove(&self, ndx: usize) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            lists::list_remove(tx, group, repl, self.table, self.key, self.col, ndx)
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.txn.with_write(|tx, group, repl| {
            lists::list_clear(tx, group, repl, self.table, self.key, self.col)
        })
    }

    pub fn sort(&self, indices: &mut Vec<usize>, ascending: bool) -> Result<()> {
        self.txn.with_read(|alloc, group| {
            lists::list_sort(
                alloc, group, self.table, self.key, self.col, indices, ascending,
            )
        })
    }

    pub fn distinct(&self, indices: &mut Vec<usize>, sort_ascending: Option<bool>) -> Result<()> {
        self.txn.with_read(|alloc, group| {
            lists::list_distinct(
                alloc,
                group,
                self.table,
                self.key,
                self.col,
                indices,
                sort_ascending,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbOptions;
    use crate::table::spec::ATTR_PRIMARY;

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

    #[test]
    fn empty_read_transaction_sees_no_tables() {
        let db = mem_db();
        let txn = Transaction::begin_read(&db).unwrap();
        assert_eq!(txn.table_names().unwrap().len(), 0);
        assert_eq!(txn.version(), 0);
    }

    #[test]
    fn committed_write_is_visible_to_new_readers() {
        let db = mem_db();
        let txn = Transaction::begin_write(&db).unwrap();
        let table = txn.add_table("class_object", false).unwrap();
        let col = table.add_column("value", ColumnType::Int, false).unwrap();
        let obj = table.create_object().unwrap();
        obj.set(col, Value::Int(42)).unwrap();
        let version = txn.commit().unwrap();
        assert_eq!(version, 1);

        let reader = Transaction::begin_read(&db).unwrap();
        assert_eq!(reader.version(), 1);
        let table = reader.get_table("class_object").unwrap().unwrap();
        assert_eq!(table.size().unwrap(), 1);
        let obj = table.get_object(ObjKey(0)).unwrap();
        assert_eq!(obj.get_int(col).unwrap(), 42);
    }

    #[test]
    fn snapshot_isolation_for_pinned_reader() {
        let db = mem_db();
        {
            let txn = Transaction::begin_write(&db).unwrap();
            let table = txn.add_table("class_object", false).unwrap();
            table.add_column("value", ColumnType::Int, false).unwrap();
            txn.commit().unwrap();
        }

        let reader = Transaction::begin_read(&db).unwrap();
        let before = reader
            .get_table("class_object")
            .unwrap()
            .unwrap()
            .size()
            .unwrap();

        {
            let writer = Transaction::begin_write(&db).unwrap();
            let table = writer.get_table("class_object").unwrap().unwrap();
            table.create_object().unwrap();
            writer.commit().unwrap();
        }

        // The pinned reader still sees the old state.
        let after = reader
            .get_table("class_object")
            .unwrap()
            .unwrap()
            .size()
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(after, 0);

        // A fresh reader sees the commit.
        let fresh = Transaction::begin_read(&db).unwrap();
        assert_eq!(
            fresh.get_table("class_object").unwrap().unwrap().size().unwrap(),
            1
        );
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let db = mem_db();
        {
            let txn = Transaction::begin_write(&db).unwrap();
            txn.add_table("class_object", false).unwrap();
            txn.commit().unwrap();
        }
        {
            let txn = Transaction::begin_write(&db).unwrap();
            let table = txn.get_table("class_object").unwrap().unwrap();
            table.create_object().unwrap();
            table.create_object().unwrap();
            txn.rollback();
        }
        let reader = Transaction::begin_read(&db).unwrap();
        assert_eq!(
            reader.get_table("class_object").unwrap().unwrap().size().unwrap(),
            0
        );
        assert_eq!(reader.version(), 1);
    }

    #[test]
    fn writes_require_write_stage() {
        let db = mem_db();
        let txn = Transaction::begin_read(&db).unwrap();
        let result = txn.add_table("class_object", false);
        let report = result.err().unwrap();
        assert!(matches!(
            crate::error::kind_of(&report),
            Some(ErrorKind::InvalidTransaction(_))
        ));
    }

    #[test]
    fn promote_and_demote() {
        let db = mem_db();
        let mut txn = Transaction::begin_read(&db).unwrap();
        txn.promote_to_write().unwrap();
        txn.add_table("class_object", false).unwrap();
        txn.demote_to_read().unwrap();
        // The uncommitted table is gone after demote.
        assert!(!txn.has_table("class_object").unwrap());
        // The transaction can promote again.
        txn.promote_to_write().unwrap();
        txn.add_table("class_object", false).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn writer_sees_its_own_uncommitted_changes() {
        let db = mem_db();
        let txn = Transaction::begin_write(&db).unwrap();
        let table = txn.add_table("class_object", false).unwrap();
        let col = table.add_column("value", ColumnType::Int, false).unwrap();
        let obj = table.create_object().unwrap();
        obj.set(col, Value::Int(7)).unwrap();
        assert_eq!(obj.get_int(col).unwrap(), 7);
        assert_eq!(table.size().unwrap(), 1);
        txn.rollback();
    }

    #[test]
    fn changesets_accumulate_in_history() {
        let db = mem_db();
        {
            let txn = Transaction::begin_write(&db).unwrap();
            let table = txn.add_table("class_object", false).unwrap();
            table.add_column("value", ColumnType::Int, false).unwrap();
            txn.commit().unwrap();
        }
        {
            let txn = Transaction::begin_write(&db).unwrap();
            let table = txn.get_table("class_object").unwrap().unwrap();
            table.create_object().unwrap();
            txn.commit().unwrap();
        }
        let reader = Transaction::begin_read(&db).unwrap();
        let changesets = reader.changesets_since(0).unwrap();
        assert_eq!(changesets.len(), 2);
        assert_eq!(changesets[0].0, 1);
        assert_eq!(changesets[1].0, 2);
        assert!(!changesets[0].1.is_empty());
    }

    #[test]
    fn applied_changeset_reaches_other_database() {
        let db1 = mem_db();
        {
            let txn = Transaction::begin_write(&db1).unwrap();
            let table = txn.add_table("class_object", false).unwrap();
            let col = table.add_column("value", ColumnType::Int, false).unwrap();
            let obj = table.create_object().unwrap();
            obj.set(col, Value::Int(10)).unwrap();
            txn.commit().unwrap();
        }
        let changesets = {
            let reader = Transaction::begin_read(&db1).unwrap();
            reader.changesets_since(0).unwrap()
        };

        let db2 = mem_db();
        let txn = Transaction::begin_write(&db2).unwrap();
        for (_, cs) in &changesets {
            txn.apply_changeset(cs).unwrap();
        }
        txn.commit().unwrap();

        let reader = Transaction::begin_read(&db2).unwrap();
        let table = reader.get_table("class_object").unwrap().unwrap();
        assert_eq!(table.size().unwrap(), 1);
        let col = table.column_key("value").unwrap().unwrap();
        assert_eq!(
            table.get_object(ObjKey(0)).unwrap().get_int(col).unwrap(),
            10
        );
    }

    #[test]
    fn find_first_uses_index_when_present() {
        let db = mem_db();
        let txn = Transaction::begin_write(&db).unwrap();
        let table = txn.add_table("class_object", false).unwrap();
        let col = table.add_column("name", ColumnType::String, false).unwrap();
        table.add_search_index(col).unwrap();
        for name in ["a", "b", "c"] {
            let obj = table.create_object().unwrap();
            obj.set(col, Value::String(name.into())).unwrap();
        }
        assert_eq!(
            table
                .find_first(col, &Value::String("b".into()))
                .unwrap(),
            Some(ObjKey(1))
        );
        txn.commit().unwrap();
    }

    #[test]
    fn primary_key_upsert_returns_existing() {
        let db = mem_db();
        let txn = Transaction::begin_write(&db).unwrap();
        let table = txn.add_table("class_object", false).unwrap();
        table
            .add_column_with_attrs("pk", ColumnType::Int, ATTR_PRIMARY, None)
            .unwrap();
        let a = table.create_object_with_primary_key(Value::Int(9)).unwrap();
        let b = table.create_object_with_primary_key(Value::Int(9)).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(table.size().unwrap(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn write_copy_opens_read_only() {
        let db = mem_db();
        {
            let txn = Transaction::begin_write(&db).unwrap();
            let table = txn.add_table("class_object", false).unwrap();
            let col = table.add_column("value", ColumnType::Int, false).unwrap();
            let obj = table.create_object().unwrap();
            obj.set(col, Value::Int(42)).unwrap();
            txn.commit().unwrap();
        }
        let reader = Transaction::begin_read(&db).unwrap();
        let image = reader.write_copy_to_mem().unwrap();

        let db2 = DB::open(
            None,
            DbOptions {
                buffer: Some(image),
                ..Default::default()
            },
        )
        .unwrap();
        let txn2 = Transaction::begin_read(&db2).unwrap();
        let table = txn2.get_table("class_object").unwrap().unwrap();
        assert_eq!(table.size().unwrap(), 1);
        let col = table.column_key("value").unwrap().unwrap();
        assert_eq!(
            table.get_object(ObjKey(0)).unwrap().get_int(col).unwrap(),
            42
        );
    }

    #[test]
    fn version_ring_blocks_when_exhausted() {
        let db = mem_db();
        let mut pins = Vec::new();
        for _ in 0..crate::db::control::RING_SIZE {
            pins.push(Transaction::begin_read(&db).unwrap());
            let txn = Transaction::begin_write(&db).unwrap();
            txn.add_table(&format!("class_t{}", pins.len()), false).unwrap();
            if let Err(report) = txn.commit() {
                // Ring filled up with pinned readers before we got through.
                assert!(matches!(
                    crate::error::kind_of(&report),
                    Some(ErrorKind::LogicError(_))
                ));
                return;
            }
        }
        unreachable!("ring should have been exhausted by pinned readers");
    }
}
