//! # Table
//!
//! Schema-aware object storage for one class: the spec, the cluster tree,
//! and the system-managed backlink columns. The module exposes internal
//! operations consumed by the transaction layer; the public accessor types
//! live with the transaction so their lifetimes are tied to it.
//!
//! ## On-Disk Layout
//!
//! ```text
//! table top (has_refs): [spec_ref, cluster_root, tagged next_key, tagged flags]
//! ```
//!
//! `next_key` is the object-key sequence; `flags` bit 0 marks an embedded
//! table.
//!
//! ## Link Consistency
//!
//! For every forward link column in table A targeting table B there is a
//! backlink column in B listing the A-keys holding the link. All link
//! writes route through [`backlink_add`]/[`backlink_remove`], so forward
//! and backward views agree at every commit. Removing an object nullifies
//! incoming links through the backlink column, and removing the last
//! (strong) backlink of a strong-link target or an embedded object pushes
//! it onto the cascade set for recursive removal.

pub mod fields;
pub mod index;
pub mod lists;
pub mod spec;

use eyre::Result;
use smallvec::SmallVec;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::{free_tree, is_tagged, tag_int, untag_int, Array};
use crate::cluster::{self, ColumnData, ColumnKind};
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::node::FLAG_HAS_REFS;
use crate::repl::TransactLog;
use crate::value::{ColKey, ObjKey, TableKey};

use spec::{backlink_column_name, ColumnSpec, ColumnType, Spec, ATTR_LIST};

pub const TABLE_FLAG_EMBEDDED: i64 = 0x1;

/// In-memory handle on one table's persisted state.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub key: TableKey,
    pub spec: Spec,
    pub spec_ref: Ref,
    pub cluster: Ref,
    pub next_key: i64,
    pub flags: i64,
}

impl TableInfo {
    pub fn is_embedded(&self) -> bool {
        self.flags & TABLE_FLAG_EMBEDDED != 0
    }
}

pub fn load_table<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    key: TableKey,
) -> Result<TableInfo> {
    let top_ref = group.table_top(key)?;
    let top = Array::load(alloc, top_ref)?;
    if top.len() != 4 || !is_tagged(top.get(2)) || !is_tagged(top.get(3)) {
        return Err(err(ErrorKind::InvalidDatabase(format!(
            "table top for key {} is malformed",
            key.0
        ))));
    }
    let spec_ref = top.get(0) as Ref;
    Ok(TableInfo {
        key,
        spec: Spec::load(alloc, spec_ref)?,
        spec_ref,
        cluster: top.get(1) as Ref,
        next_key: untag_int(top.get(2)),
        flags: untag_int(top.get(3)),
    })
}

fn store_table_top(tx: &mut WriteAlloc, info: &TableInfo) -> Result<Ref> {
    Array::from_values(
        FLAG_HAS_REFS,
        vec![
            info.spec_ref as i64,
            info.cluster as i64,
            tag_int(info.next_key),
            tag_int(info.flags),
        ],
    )
    .store(tx)
}

/// Persists a table handle whose cluster root (and optionally spec) moved,
/// freeing the previous top node.
pub fn save_table(
    tx: &mut WriteAlloc,
    group: &mut Group,
    info: &mut TableInfo,
    spec_dirty: bool,
) -> Result<()> {
    if spec_dirty {
        Spec::free_stored(tx, info.spec_ref)?;
        info.spec_ref = info.spec.store(tx)?;
    }
    let old_top = group.table_top(info.key)?;
    tx.free_node(old_top)?;
    let new_top = store_table_top(tx, info)?;
    group.set_table_top(info.key, new_top)
}

/// Creates an empty table and registers it in the group directory.
pub fn create_table(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    name: &str,
    embedded: bool,
) -> Result<TableKey> {
    let spec = Spec::new();
    let spec_ref = spec.store(tx)?;
    let cluster = cluster::create_empty(tx, &[])?;
    let mut info = TableInfo {
        key: TableKey(0),
        spec,
        spec_ref,
        cluster,
        next_key: 0,
        flags: if embedded { TABLE_FLAG_EMBEDDED } else { 0 },
    };
    let top = store_table_top(tx, &info)?;
    let key = group.add_table_entry(name, top)?;
    info.key = key;
    if let Some(log) = repl.as_mut() {
        log.insert_group_level_table(key, name, embedded);
    }
    Ok(key)
}

/// Creates a table at a fixed key (changeset application).
pub fn create_table_at(
    tx: &mut WriteAlloc,
    group: &mut Group,
    key: TableKey,
    name: &str,
    embedded: bool,
) -> Result<()> {
    let spec = Spec::new();
    let spec_ref = spec.store(tx)?;
    let cluster = cluster::create_empty(tx, &[])?;
    let info = TableInfo {
        key,
        spec,
        spec_ref,
        cluster,
        next_key: 0,
        flags: if embedded { TABLE_FLAG_EMBEDDED } else { 0 },
    };
    let top = store_table_top(tx, &info)?;
    group.add_table_entry_at(key, name, top)
}

/// Removes a table. Rejected while any other table holds a link column
/// targeting it; the table's own outbound link columns have their backlink
/// mirrors removed from the target tables first.
pub fn remove_table(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    key: TableKey,
) -> Result<()> {
    for other in group.table_keys() {
        if other == key {
            continue;
        }
        let other_info = load_table(tx, group, other)?;
        for (_, col) in other_info.spec.public_columns() {
            if col.ty == ColumnType::Link && col.peer_table == Some(key) {
                return Err(err(ErrorKind::LogicError(format!(
                    "table '{}' is the target of links from '{}'",
                    group.table_name(key)?,
                    group.table_name(other)?
                ))));
            }
        }
    }

    let info = load_table(tx, group, key)?;
    let outbound: Vec<(TableKey, ColKey)> = info
        .spec
        .public_columns()
        .filter(|(_, c)| c.ty == ColumnType::Link)
        .filter_map(|(ck, c)| c.peer_table.map(|t| (t, ck)))
        .collect();
    for (target, origin_col) in outbound {
        if target == key || !group.has_table(target) {
            continue;
        }
        let mut target_info = load_table(tx, group, target)?;
        if let Some(bl_col) = target_info.spec.backlink_col_for(key, origin_col) {
            drop_column_storage(tx, &mut target_info, bl_col)?;
            save_table(tx, group, &mut target_info, true)?;
        }
    }

    let top = group.remove_table_entry(key)?;
    free_tree(tx, top)?;
    if let Some(log) = repl.as_mut() {
        log.erase_group_level_table(key);
    }
    Ok(())
}

pub fn rename_table(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    key: TableKey,
    new_name: &str,
) -> Result<()> {
    let _ = tx;
    group.rename_table_entry(key, new_name)?;
    if let Some(log) = repl.as_mut() {
        log.rename_group_level_table(key, new_name);
    }
    Ok(())
}

/// Adds a column. Link columns grow a matching backlink column in the
/// target table.
pub fn add_column(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    column: ColumnSpec,
) -> Result<ColKey> {
    if column.ty == ColumnType::Backlink {
        return Err(err(ErrorKind::LogicError(
            "backlink columns are system-managed".into(),
        )));
    }
    let mut info = load_table(tx, group, table)?;
    if info.spec.find_public(&column.name).is_some() {
        return Err(err(ErrorKind::LogicError(format!(
            "column '{}' already exists",
            column.name
        ))));
    }
    if column.ty == ColumnType::Link {
        let target = column.peer_table.ok_or_else(|| {
            err(ErrorKind::LogicError("link column needs a target table".into()))
        })?;
        if !group.has_table(target) {
            return Err(err(ErrorKind::LogicError(format!(
                "link target table key {} does not exist",
                target.0
            ))));
        }
    }

    let kind = column.kind();
    let ty = column.ty;
    let attrs = column.attrs;
    let name = column.name.clone();
    let target = column.peer_table;
    let col_key = info.spec.add(column);
    info.cluster = cluster::add_column(tx, info.cluster, kind)?;
    save_table(tx, group, &mut info, true)?;

    if ty == ColumnType::Link {
        let target = target.expect("validated above");
        let backlink = ColumnSpec {
            name: backlink_column_name(table, col_key),
            ty: ColumnType::Backlink,
            attrs: 0,
            peer_table: Some(table),
            origin_col: Some(col_key),
        };
        let mut target_info = load_table(tx, group, target)?;
        target_info.spec.add(backlink);
        target_info.cluster =
            cluster::add_column(tx, target_info.cluster, ColumnKind::Backlinks)?;
        save_table(tx, group, &mut target_info, true)?;
    }

    if let Some(log) = repl.as_mut() {
        log.insert_column(
            table,
            col_key,
            &name,
            ty.code(),
            attrs,
            target.map(|t| t.0 + 1).unwrap_or(0),
        );
    }
    Ok(col_key)
}

/// Tombstones a column's spec slot and frees its cluster storage.
fn drop_column_storage(tx: &mut WriteAlloc, info: &mut TableInfo, col: ColKey) -> Result<()> {
    let removed = info.spec.erase(col)?;
    info.cluster = cluster::remove_column(tx, info.cluster, col.0 as usize, removed.kind())?;
    Ok(())
}

pub fn remove_column(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    col: ColKey,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    let column = info.spec.col(col)?.clone();
    if column.ty == ColumnType::Backlink {
        return Err(err(ErrorKind::LogicError(
            "backlink columns are system-managed".into(),
        )));
    }

    drop_column_storage(tx, &mut info, col)?;
    save_table(tx, group, &mut info, true)?;

    if column.ty == ColumnType::Link {
        if let Some(target) = column.peer_table {
            if group.has_table(target) {
                let mut target_info = load_table(tx, group, target)?;
                if let Some(bl_col) = target_info.spec.backlink_col_for(table, col) {
                    drop_column_storage(tx, &mut target_info, bl_col)?;
                    save_table(tx, group, &mut target_info, true)?;
                }
            }
        }
    }

    if let Some(log) = repl.as_mut() {
        log.erase_column(table, col);
    }
    Ok(())
}

pub fn rename_column(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    col: ColKey,
    new_name: &str,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    if info.spec.find_public(new_name).is_some() {
        return Err(err(ErrorKind::LogicError(format!(
            "column '{}' already exists",
            new_name
        ))));
    }
    {
        let slot = info
            .spec
            .columns
            .get_mut(col.0 as usize)
            .and_then(|c| c.as_mut())
            .ok_or_else(|| {
                err(ErrorKind::LogicError(format!(
                    "column key {} does not exist",
                    col.0
                )))
            })?;
        slot.name = new_name.to_owned();
    }
    save_table(tx, group, &mut info, true)?;
    if let Some(log) = repl.as_mut() {
        log.rename_column(table, col, new_name);
    }
    Ok(())
}

pub fn table_size<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
) -> Result<usize> {
    let info = load_table(alloc, group, table)?;
    cluster::size(alloc, info.cluster)
}

pub fn object_exists<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
) -> Result<bool> {
    let info = load_table(alloc, group, table)?;
    cluster::is_valid_key(alloc, info.cluster, key.0)
}

/// Creates an object. With `key = None` the table's key sequence assigns
/// the identity; an explicit key (changeset application, primary keys)
/// advances the sequence past itself.
pub fn create_object(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: Option<ObjKey>,
) -> Result<ObjKey> {
    let mut info = load_table(tx, group, table)?;
    let key = match key {
        Some(k) => {
            if k.0 >= info.next_key {
                info.next_key = k.0 + 1;
            }
            k
        }
        None => {
            let k = ObjKey(info.next_key);
            info.next_key += 1;
            k
        }
    };
    let kinds = info.spec.kinds();
    info.cluster = cluster::insert_key(tx, info.cluster, key.0, &kinds)?;
    save_table(tx, group, &mut info, false)?;
    if let Some(log) = repl.as_mut() {
        log.create_object(table, key);
    }
    Ok(key)
}

/// Raw cell read: the column ref and the in-cluster row index for a key.
pub fn locate_cell<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
    col: ColKey,
) -> Result<(Ref, usize)> {
    let (leaf, idx) = cluster::lookup(alloc, info.cluster, key.0)?.ok_or_else(|| {
        err(ErrorKind::LogicError(format!(
            "object key {} does not exist",
            key.0
        )))
    })?;
    let col_ref = cluster::col_ref(alloc, leaf, col.0 as usize)?;
    if col_ref == 0 {
        return Err(err(ErrorKind::LogicError(format!(
            "column key {} does not exist",
            col.0
        ))));
    }
    Ok((col_ref, idx))
}

// --- Backlink maintenance -------------------------------------------------

/// Decodes a backlink slot into its origin-key list.
pub fn backlink_slot_keys<A: Allocator + ?Sized>(alloc: &A, slot: i64) -> Result<Vec<i64>> {
    if slot == 0 {
        Ok(Vec::new())
    } else if is_tagged(slot) {
        Ok(vec![untag_int(slot)])
    } else {
        Ok(Array::load(alloc, slot as Ref)?.values)
    }
}

fn encode_backlink_slot(tx: &mut WriteAlloc, keys: &[i64]) -> Result<i64> {
    match keys.len() {
        0 => Ok(0),
        1 => Ok(tag_int(keys[0])),
        _ => Ok(Array::from_values(0, keys.to_vec()).store(tx)? as i64),
    }
}

fn update_backlink_slot(
    tx: &mut WriteAlloc,
    info: &mut TableInfo,
    target: ObjKey,
    bl_col: ColKey,
    f: impl FnOnce(&mut Vec<i64>),
) -> Result<()> {
    let (col_ref, idx) = locate_cell(tx, info, target, bl_col)?;
    let old_slot = Array::get_direct(tx, col_ref, idx)?;
    let mut keys = backlink_slot_keys(tx, old_slot)?;
    f(&mut keys);
    let new_slot = encode_backlink_slot(tx, &keys)?;
    info.cluster = cluster::update_cell(
        tx,
        info.cluster,
        target.0,
        bl_col.0 as usize,
        ColumnKind::Backlinks,
        |data, i| {
            match data {
                ColumnData::Backlinks(v) => v[i] = new_slot,
                _ => {
                    return Err(err(ErrorKind::InvalidDatabase(
                        "backlink column has wrong layout".into(),
                    )))
                }
            }
            Ok(())
        },
    )?;
    if old_slot != 0 && !is_tagged(old_slot) {
        tx.free_node(old_slot as Ref)?;
    }
    Ok(())
}

/// Records `origin_key` as referencing `target` through the link column
/// mirrored by `bl_col`.
pub fn backlink_add(
    tx: &mut WriteAlloc,
    group: &mut Group,
    target_table: TableKey,
    target: ObjKey,
    bl_col: ColKey,
    origin_key: ObjKey,
) -> Result<()> {
    let mut info = load_table(tx, group, target_table)?;
    update_backlink_slot(tx, &mut info, target, bl_col, |keys| {
        keys.push(origin_key.0)
    })?;
    save_table(tx, group, &mut info, false)
}

/// Removes one backlink entry. Returns the target's remaining total
/// backlink count so the caller can decide on cascade.
pub fn backlink_remove(
    tx: &mut WriteAlloc,
    group: &mut Group,
    target_table: TableKey,
    target: ObjKey,
    bl_col: ColKey,
    origin_key: ObjKey,
) -> Result<usize> {
    let mut info = load_table(tx, group, target_table)?;
    update_backlink_slot(tx, &mut info, target, bl_col, |keys| {
        if let Some(pos) = keys.iter().position(|&k| k == origin_key.0) {
            keys.remove(pos);
        }
    })?;
    save_table(tx, group, &mut info, false)?;
    let info = load_table(tx, group, target_table)?;
    total_backlink_count(tx, &info, target)
}

pub fn backlink_count<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
    bl_col: ColKey,
) -> Result<usize> {
    let (col_ref, idx) = locate_cell(alloc, info, key, bl_col)?;
    let slot = Array::get_direct(alloc, col_ref, idx)?;
    Ok(backlink_slot_keys(alloc, slot)?.len())
}

pub fn backlink_get<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
    bl_col: ColKey,
    ndx: usize,
) -> Result<ObjKey> {
    let (col_ref, idx) = locate_cell(alloc, info, key, bl_col)?;
    let slot = Array::get_direct(alloc, col_ref, idx)?;
    let keys = backlink_slot_keys(alloc, slot)?;
    keys.get(ndx).map(|&k| ObjKey(k)).ok_or_else(|| {
        err(ErrorKind::LogicError(format!(
            "backlink index {} out of range (count {})",
            ndx,
            keys.len()
        )))
    })
}

/// Total incoming links across every backlink column of the table.
pub fn total_backlink_count<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
) -> Result<usize> {
    let mut total = 0usize;
    for (_, _, bl_col) in info.spec.backlink_columns() {
        total += backlink_count(alloc, info, key, bl_col)?;
    }
    Ok(total)
}

// --- Object removal and cascade -------------------------------------------

pub type CascadeSet = SmallVec<[(TableKey, ObjKey); 4]>;

/// Whether losing a backlink should delete the target: strong link columns
/// and embedded tables cascade once the total backlink count reaches zero.
pub fn cascade_candidate(
    remaining_backlinks: usize,
    link_is_strong: bool,
    target_embedded: bool,
) -> bool {
    remaining_backlinks == 0 && (link_is_strong || target_embedded)
}

/// Removes an object and drains the resulting cascade set: objects whose
/// last strong incoming link disappeared are removed recursively, growing
/// the set as they drop their own links.
pub fn remove_object(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
) -> Result<()> {
    if !object_exists(tx, group, table, key)? {
        return Err(err(ErrorKind::LogicError(format!(
            "object key {} does not exist",
            key.0
        ))));
    }
    let mut cascade: CascadeSet = SmallVec::new();
    cascade.push((table, key));
    while let Some((t, k)) = cascade.pop() {
        if !group.has_table(t) || !object_exists(tx, group, t, k)? {
            continue;
        }
        remove_one(tx, group, repl, t, k, &mut cascade)?;
    }
    Ok(())
}

fn remove_one(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    cascade: &mut CascadeSet,
) -> Result<()> {
    // The spec itself is stable for the duration; cluster roots are not,
    // so the table handle is reloaded after every mutation below.
    let spec = load_table(tx, group, table)?.spec;

    // Nullify incoming forward links through our backlink columns. These
    // edits are derived effects of the removal and are not re-recorded.
    for (origin_table, origin_col, bl_col) in spec.backlink_columns() {
        let info = load_table(tx, group, table)?;
        let (col_ref, idx) = locate_cell(tx, &info, key, bl_col)?;
        let slot = Array::get_direct(tx, col_ref, idx)?;
        let origins = backlink_slot_keys(tx, slot)?;
        for origin in origins {
            nullify_forward_link(tx, group, origin_table, ObjKey(origin), origin_col, key)?;
        }
    }

    // Drop our own outbound links, collecting cascade candidates.
    let link_columns: Vec<(ColKey, spec::ColumnSpec)> = spec
        .public_columns()
        .filter(|(_, c)| c.ty == ColumnType::Link)
        .map(|(k, c)| (k, c.clone()))
        .collect();
    for (col_key, col) in link_columns {
        let info = load_table(tx, group, table)?;
        let target_table = col.peer_table.expect("link column has target");
        let strong = col.is_strong();
        let targets: Vec<ObjKey> = if col.attrs & ATTR_LIST != 0 {
            lists::link_list_targets(tx, &info, key, col_key)?
        } else {
            let (col_ref, idx) = locate_cell(tx, &info, key, col_key)?;
            match Array::get_direct(tx, col_ref, idx)? {
                0 => Vec::new(),
                raw => vec![ObjKey(raw - 1)],
            }
        };
        if targets.is_empty() {
            continue;
        }
        let target_info = load_table(tx, group, target_table)?;
        let embedded = target_info.is_embedded();
        let bl_col = target_info
            .spec
            .backlink_col_for(table, col_key)
            .ok_or_else(|| {
                err(ErrorKind::InvalidDatabase(
                    "link column without backlink mirror".into(),
                ))
            })?;
        for target in targets {
            if target.is_unresolved() {
                continue;
            }
            let remaining =
                backlink_remove(tx, group, target_table, target, bl_col, key)?;
            if cascade_candidate(remaining, strong, embedded) {
                cascade.push((target_table, target));
            }
        }
    }

    // Physically remove the row; list trees and backlink arrays the row
    // owns are freed by the cluster layer.
    let mut info = load_table(tx, group, table)?;
    let kinds = info.spec.kinds();
    info.cluster = cluster::erase_key(tx, info.cluster, key.0, &kinds)?;
    save_table(tx, group, &mut info, false)?;

    if let Some(log) = repl.as_mut() {
        log.remove_object(table, key);
    }
    Ok(())
}

/// Clears `origin`'s forward reference(s) to `removed_key` without touching
/// the target's backlinks (the target row is going away).
fn nullify_forward_link(
    tx: &mut WriteAlloc,
    group: &mut Group,
    origin_table: TableKey,
    origin: ObjKey,
    origin_col: ColKey,
    removed_key: ObjKey,
) -> Result<()> {
    let mut info = load_table(tx, group, origin_table)?;
    let col = info.spec.col(origin_col)?.clone();
    if col.attrs & ATTR_LIST != 0 {
        lists::link_list_remove_all(tx, &mut info, origin, origin_col, removed_key)?;
    } else {
        info.cluster = cluster::update_cell(
            tx,
            info.cluster,
            origin.0,
            origin_col.0 as usize,
            ColumnKind::Keys,
            |data, i| {
                match data {
                    ColumnData::Keys(v) => {
                        if v[i] == removed_key.0 + 1 {
                            v[i] = 0;
                        }
                    }
                    _ => {
                        return Err(err(ErrorKind::InvalidDatabase(
                            "link column has wrong layout".into(),
                        )))
                    }
                }
                Ok(())
            },
        )?;
    }
    save_table(tx, group, &mut info, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FileMap, SlabAlloc, FILE_HEADER_SIZE};

    fn setup() -> (std::sync::Arc<SlabAlloc>, WriteAlloc, Group, Option<TransactLog>) {
        let slab = std::sync::Arc::new(SlabAlloc::new(FileMap::new_mem().unwrap()));
        let tx = WriteAlloc::new(slab.clone(), FILE_HEADER_SIZE as u64, Vec::new());
        (slab, tx, Group::default(), Some(TransactLog::new()))
    }

    fn int_col(name: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            ty: ColumnType::Int,
            attrs: 0,
            peer_table: None,
            origin_col: None,
        }
    }

    #[test]
    fn create_table_and_object() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_object", false).unwrap();
        add_column(&mut tx, &mut group, &mut repl, t, int_col("value")).unwrap();
        let key = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        assert_eq!(key, ObjKey(0));
        assert!(object_exists(&tx, &group, t, key).unwrap());
        assert_eq!(table_size(&tx, &group, t).unwrap(), 1);
    }

    #[test]
    fn object_keys_are_sequential_and_stable() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_object", false).unwrap();
        let k0 = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        let k1 = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        remove_object(&mut tx, &mut group, &mut repl, t, k0).unwrap();
        let k2 = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        assert_eq!((k0, k1, k2), (ObjKey(0), ObjKey(1), ObjKey(2)));
    }

    #[test]
    fn explicit_key_advances_sequence() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_object", false).unwrap();
        create_object(&mut tx, &mut group, &mut repl, t, Some(ObjKey(10))).unwrap();
        let next = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        assert_eq!(next, ObjKey(11));
    }

    #[test]
    fn link_column_grows_backlink_mirror() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let a = create_table(&mut tx, &mut group, &mut repl, "class_a", false).unwrap();
        let b = create_table(&mut tx, &mut group, &mut repl, "class_b", false).unwrap();
        let link = add_column(
            &mut tx,
            &mut group,
            &mut repl,
            a,
            ColumnSpec {
                name: "to_b".into(),
                ty: ColumnType::Link,
                attrs: 0,
                peer_table: Some(b),
                origin_col: None,
            },
        )
        .unwrap();
        let b_info = load_table(&tx, &group, b).unwrap();
        assert_eq!(b_info.spec.backlink_col_for(a, link), Some(ColKey(0)));
    }

    #[test]
    fn remove_linked_target_table_is_rejected() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let a = create_table(&mut tx, &mut group, &mut repl, "class_a", false).unwrap();
        let b = create_table(&mut tx, &mut group, &mut repl, "class_b", false).unwrap();
        add_column(
            &mut tx,
            &mut group,
            &mut repl,
            a,
            ColumnSpec {
                name: "to_b".into(),
                ty: ColumnType::Link,
                attrs: 0,
                peer_table: Some(b),
                origin_col: None,
            },
        )
        .unwrap();
        assert!(remove_table(&mut tx, &mut group, &mut repl, b).is_err());
        remove_column(&mut tx, &mut group, &mut repl, a, ColKey(0)).unwrap();
        remove_table(&mut tx, &mut group, &mut repl, b).unwrap();
    }

    #[test]
    fn backlinks_track_adds_and_removes() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let link = add_column(
            &mut tx,
            &mut group,
            &mut repl,
            t,
            ColumnSpec {
                name: "self_ref".into(),
                ty: ColumnType::Link,
                attrs: 0,
                peer_table: Some(t),
                origin_col: None,
            },
        )
        .unwrap();
        let target = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        let o1 = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        let o2 = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();

        let info = load_table(&tx, &group, t).unwrap();
        let bl = info.spec.backlink_col_for(t, link).unwrap();
        backlink_add(&mut tx, &mut group, t, target, bl, o1).unwrap();
        backlink_add(&mut tx, &mut group, t, target, bl, o2).unwrap();

        let info = load_table(&tx, &group, t).unwrap();
        assert_eq!(backlink_count(&tx, &info, target, bl).unwrap(), 2);
        assert_eq!(backlink_get(&tx, &info, target, bl, 0).unwrap(), o1);

        let remaining = backlink_remove(&mut tx, &mut group, t, target, bl, o1).unwrap();
        assert_eq!(remaining, 1);
        let remaining = backlink_remove(&mut tx, &mut group, t, target, bl, o2).unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn rename_column_keeps_key() {
        let (_slab, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let col = add_column(&mut tx, &mut group, &mut repl, t, int_col("old")).unwrap();
        rename_column(&mut tx, &mut group, &mut repl, t, col, "new").unwrap();
        let info = load_table(&tx, &group, t).unwrap();
        assert_eq!(info.spec.col(col).unwrap().name, "new");
        assert_eq!(info.spec.find_public("new"), Some(col));
    }
}
