//! # Cluster Tree
//!
//! Object storage for one table: a keyed B+tree whose leaves are
//! **clusters**, column-major bundles of up to 256 objects. A cluster is an
//! array of refs where slot 0 addresses the sorted key array and slot `i+1`
//! addresses the column-`i` array:
//!
//! ```text
//! leaf  (has_refs | context):      [keys_ref, col_0, col_1, ...]
//! inner (has_refs | inner_bptree): [first_keys_ref, counts_ref, child_0, ...]
//! ```
//!
//! Inner nodes carry the first key of each subtree (for key descent) and
//! cumulative object counts (for O(log N) size). Keys enumerate in key
//! order. Every mutation is copy-on-write and returns the new root ref.
//!
//! Column slots are positionally stable: removing a column zeroes its slot
//! (and the matching spec slot is tombstoned) rather than shifting the
//! remaining columns, so column keys stay valid across removals. Adding a
//! column appends a slot to every cluster, populated with defaults.

pub mod column;

pub use column::{ColumnData, ColumnKind};

use eyre::Result;

use crate::alloc::{node_header, Allocator, Ref, WriteAlloc};
use crate::array::{free_tree, is_tagged, Array};
use crate::error::{err, ErrorKind};
use crate::node::{FLAG_CONTEXT, FLAG_HAS_REFS, FLAG_INNER_BPTREE};

pub const MAX_CLUSTER_SIZE: usize = 256;

/// Column layout per slot; `None` marks a tombstoned (removed) column.
pub type Kinds<'a> = &'a [Option<ColumnKind>];

enum InsertOut {
    Updated(Ref),
    Split(Ref, Ref),
}

enum EraseOut {
    Updated(Ref),
    Emptied,
}

fn store_leaf(tx: &mut WriteAlloc, keys_ref: Ref, col_refs: &[Ref]) -> Result<Ref> {
    let mut slots = Vec::with_capacity(1 + col_refs.len());
    slots.push(keys_ref as i64);
    slots.extend(col_refs.iter().map(|&r| r as i64));
    Array::from_values(FLAG_HAS_REFS | FLAG_CONTEXT, slots).store(tx)
}

fn load_leaf<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<(Ref, Vec<Ref>)> {
    let slots = Array::load(alloc, r)?;
    if slots.is_empty() {
        return Err(err(ErrorKind::InvalidDatabase(
            "cluster node has no key slot".into(),
        )));
    }
    let keys_ref = slots.get(0) as Ref;
    let col_refs = slots.values[1..].iter().map(|&v| v as Ref).collect();
    Ok((keys_ref, col_refs))
}

fn store_inner(tx: &mut WriteAlloc, children: &[Ref]) -> Result<Ref> {
    let mut first_keys = Vec::with_capacity(children.len());
    let mut cumulative = Vec::with_capacity(children.len());
    let mut total = 0usize;
    for &child in children {
        first_keys.push(subtree_first_key(tx, child)?);
        total += subtree_count(tx, child)?;
        cumulative.push(total as i64);
    }
    let first_keys_ref = Array::from_values(0, first_keys).store(tx)?;
    let counts_ref = Array::from_values(0, cumulative).store(tx)?;
    let mut slots = Vec::with_capacity(children.len() + 2);
    slots.push(first_keys_ref as i64);
    slots.push(counts_ref as i64);
    slots.extend(children.iter().map(|&c| c as i64));
    Array::from_values(FLAG_HAS_REFS | FLAG_INNER_BPTREE, slots).store(tx)
}

fn load_inner<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<(Vec<i64>, Vec<Ref>)> {
    let slots = Array::load(alloc, r)?;
    if slots.len() < 3 {
        return Err(err(ErrorKind::InvalidDatabase(
            "inner cluster node too small".into(),
        )));
    }
    let first_keys = Array::load(alloc, slots.get(0) as Ref)?.values;
    let children = slots.values[2..].iter().map(|&v| v as Ref).collect();
    Ok((first_keys, children))
}

fn free_inner_shell(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
    let first_keys_ref = Array::get_direct(tx, r, 0)? as Ref;
    let counts_ref = Array::get_direct(tx, r, 1)? as Ref;
    tx.free_node(first_keys_ref)?;
    tx.free_node(counts_ref)?;
    tx.free_node(r)
}

fn subtree_first_key<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<i64> {
    let header = node_header(alloc, r)?;
    if header.is_inner_bptree() {
        let first_keys_ref = Array::get_direct(alloc, r, 0)? as Ref;
        Array::get_direct(alloc, first_keys_ref, 0)
    } else {
        let keys_ref = Array::get_direct(alloc, r, 0)? as Ref;
        Array::get_direct(alloc, keys_ref, 0)
    }
}

fn subtree_count<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
    let header = node_header(alloc, r)?;
    if header.is_inner_bptree() {
        let counts_ref = Array::get_direct(alloc, r, 1)? as Ref;
        let n = Array::size_direct(alloc, counts_ref)?;
        if n == 0 {
            return Ok(0);
        }
        Ok(Array::get_direct(alloc, counts_ref, n - 1)? as usize)
    } else {
        let keys_ref = Array::get_direct(alloc, r, 0)? as Ref;
        Array::size_direct(alloc, keys_ref)
    }
}

/// Picks the child subtree for `key`: the last child whose first key is at
/// or below it (the first child when the key precedes everything).
fn select_child(first_keys: &[i64], key: i64) -> usize {
    match first_keys.binary_search(&key) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

/// Creates an empty tree: one cluster with empty key and column arrays.
pub fn create_empty(tx: &mut WriteAlloc, kinds: Kinds) -> Result<Ref> {
    let keys_ref = Array::new(0).store(tx)?;
    let mut col_refs = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match kind {
            Some(k) => col_refs.push(ColumnData::new_empty(*k).store(tx)?),
            None => col_refs.push(0),
        }
    }
    store_leaf(tx, keys_ref, &col_refs)
}

pub fn size<A: Allocator + ?Sized>(alloc: &A, root: Ref) -> Result<usize> {
    subtree_count(alloc, root)
}

/// Locates `key`, returning the leaf ref and the in-leaf index.
pub fn lookup<A: Allocator + ?Sized>(
    alloc: &A,
    root: Ref,
    key: i64,
) -> Result<Option<(Ref, usize)>> {
    let mut r = root;
    loop {
        let header = node_header(alloc, r)?;
        if header.is_inner_bptree() {
            let (first_keys, children) = load_inner(alloc, r)?;
            r = children[select_child(&first_keys, key)];
            continue;
        }
        let keys_ref = Array::get_direct(alloc, r, 0)? as Ref;
        let keys = Array::load(alloc, keys_ref)?;
        return Ok(match keys.values.binary_search(&key) {
            Ok(idx) => Some((r, idx)),
            Err(_) => None,
        });
    }
}

pub fn is_valid_key<A: Allocator + ?Sized>(alloc: &A, root: Ref, key: i64) -> Result<bool> {
    Ok(lookup(alloc, root, key)?.is_some())
}

/// Ref of column `slot` inside a leaf (0 for tombstoned columns).
pub fn col_ref<A: Allocator + ?Sized>(alloc: &A, leaf: Ref, slot: usize) -> Result<Ref> {
    Ok(Array::get_direct(alloc, leaf, 1 + slot)? as Ref)
}

/// Inserts a new object row with column defaults. Fails if the key exists.
pub fn insert_key(tx: &mut WriteAlloc, root: Ref, key: i64, kinds: Kinds) -> Result<Ref> {
    match insert_recurse(tx, root, key, kinds)? {
        InsertOut::Updated(r) => Ok(r),
        InsertOut::Split(left, right) => store_inner(tx, &[left, right]),
    }
}

fn insert_recurse(tx: &mut WriteAlloc, r: Ref, key: i64, kinds: Kinds) -> Result<InsertOut> {
    let header = node_header(tx, r)?;
    if header.is_inner_bptree() {
        let (first_keys, mut children) = load_inner(tx, r)?;
        let child = select_child(&first_keys, key);
        let outcome = insert_recurse(tx, children[child], key, kinds)?;
        free_inner_shell(tx, r)?;
        match outcome {
            InsertOut::Updated(nr) => children[child] = nr,
            InsertOut::Split(left, right) => {
                children[child] = left;
                children.insert(child + 1, right);
            }
        }
        if children.len() <= MAX_CLUSTER_SIZE {
            return Ok(InsertOut::Updated(store_inner(tx, &children)?));
        }
        let right = children.split_off(children.len() / 2);
        let left_ref = store_inner(tx, &children)?;
        let right_ref = store_inner(tx, &right)?;
        return Ok(InsertOut::Split(left_ref, right_ref));
    }

    let (keys_ref, col_refs) = load_leaf(tx, r)?;
    let mut keys = Array::load(tx, keys_ref)?;
    let pos = match keys.values.binary_search(&key) {
        Ok(_) => {
            return Err(err(ErrorKind::LogicError(format!(
                "object key {} already in use",
                key
            ))))
        }
        Err(pos) => pos,
    };
    keys.insert(pos, key);

    let mut columns = Vec::with_capacity(col_refs.len());
    for (i, &cr) in col_refs.iter().enumerate() {
        match kinds.get(i).copied().flatten() {
            Some(kind) => {
                let mut data = ColumnData::load(tx, cr, kind)?;
                data.insert_default(pos);
                columns.push(Some(data));
            }
            None => columns.push(None),
        }
    }

    tx.free_node(keys_ref)?;
    for (i, &cr) in col_refs.iter().enumerate() {
        if let Some(kind) = kinds.get(i).copied().flatten() {
            ColumnData::free_stored(tx, cr, kind)?;
        }
    }
    tx.free_node(r)?;

    if keys.len() <= MAX_CLUSTER_SIZE {
        let new_keys = keys.store(tx)?;
        let mut new_cols = Vec::with_capacity(columns.len());
        for col in &columns {
            match col {
                Some(data) => new_cols.push(data.store(tx)?),
                None => new_cols.push(0),
            }
        }
        return Ok(InsertOut::Updated(store_leaf(tx, new_keys, &new_cols)?));
    }

    let mid = keys.len() / 2;
    let right_keys = Array::from_values(0, keys.values.split_off(mid));
    let mut left_cols = Vec::with_capacity(columns.len());
    let mut right_cols = Vec::with_capacity(columns.len());
    for col in &mut columns {
        match col {
            Some(data) => {
                let upper = data.split_off(mid);
                left_cols.push(data.store(tx)?);
                right_cols.push(upper.store(tx)?);
            }
            None => {
                left_cols.push(0);
                right_cols.push(0);
            }
        }
    }
    let left_keys_ref = keys.store(tx)?;
    let right_keys_ref = right_keys.store(tx)?;
    let left = store_leaf(tx, left_keys_ref, &left_cols)?;
    let right = store_leaf(tx, right_keys_ref, &right_cols)?;
    Ok(InsertOut::Split(left, right))
}

/// Removes the object row for `key`, deep-freeing list trees and backlink
/// key arrays it owns. Fails if the key is absent.
pub fn erase_key(tx: &mut WriteAlloc, root: Ref, key: i64, kinds: Kinds) -> Result<Ref> {
    match erase_recurse(tx, root, key, kinds)? {
        EraseOut::Updated(mut r) => loop {
            let header = node_header(tx, r)?;
            if !header.is_inner_bptree() {
                return Ok(r);
            }
            let (_, children) = load_inner(tx, r)?;
            if children.len() != 1 {
                return Ok(r);
            }
            free_inner_shell(tx, r)?;
            r = children[0];
        },
        EraseOut::Emptied => create_empty(tx, kinds),
    }
}

fn erase_recurse(tx: &mut WriteAlloc, r: Ref, key: i64, kinds: Kinds) -> Result<EraseOut> {
    let header = node_header(tx, r)?;
    if header.is_inner_bptree() {
        let (first_keys, mut children) = load_inner(tx, r)?;
        let child = select_child(&first_keys, key);
        let outcome = erase_recurse(tx, children[child], key, kinds)?;
        free_inner_shell(tx, r)?;
        match outcome {
            EraseOut::Updated(nr) => children[child] = nr,
            EraseOut::Emptied => {
                children.remove(child);
            }
        }
        if children.is_empty() {
            return Ok(EraseOut::Emptied);
        }
        return Ok(EraseOut::Updated(store_inner(tx, &children)?));
    }

    let (keys_ref, col_refs) = load_leaf(tx, r)?;
    let mut keys = Array::load(tx, keys_ref)?;
    let pos = match keys.values.binary_search(&key) {
        Ok(pos) => pos,
        Err(_) => {
            return Err(err(ErrorKind::LogicError(format!(
                "object key {} does not exist",
                key
            ))))
        }
    };
    keys.erase(pos);

    let mut columns = Vec::with_capacity(col_refs.len());
    for (i, &cr) in col_refs.iter().enumerate() {
        match kinds.get(i).copied().flatten() {
            Some(kind) => {
                let mut data = ColumnData::load(tx, cr, kind)?;
                // Free subtrees owned by the removed row.
                match &data {
                    ColumnData::Refs(v) => {
                        if v[pos] != 0 {
                            free_tree(tx, v[pos] as Ref)?;
                        }
                    }
                    ColumnData::Backlinks(v) => {
                        if v[pos] != 0 && !is_tagged(v[pos]) {
                            free_tree(tx, v[pos] as Ref)?;
                        }
                    }
                    _ => {}
                }
                data.erase(pos);
                columns.push(Some(data));
            }
            None => columns.push(None),
        }
    }

    tx.free_node(keys_ref)?;
    for (i, &cr) in col_refs.iter().enumerate() {
        if let Some(kind) = kinds.get(i).copied().flatten() {
            ColumnData::free_stored(tx, cr, kind)?;
        }
    }
    tx.free_node(r)?;

    if keys.is_empty() {
        return Ok(EraseOut::Emptied);
    }
    let new_keys = keys.store(tx)?;
    let mut new_cols = Vec::with_capacity(columns.len());
    for col in &columns {
        match col {
            Some(data) => new_cols.push(data.store(tx)?),
            None => new_cols.push(0),
        }
    }
    Ok(EraseOut::Updated(store_leaf(tx, new_keys, &new_cols)?))
}

/// Rewrites the column cell(s) of `key` in column `slot` through `f`, which
/// receives the loaded column and the row index.
pub fn update_cell(
    tx: &mut WriteAlloc,
    root: Ref,
    key: i64,
    slot: usize,
    kind: ColumnKind,
    f: impl FnOnce(&mut ColumnData, usize) -> Result<()>,
) -> Result<Ref> {
    update_recurse(tx, root, key, slot, kind, f)
}

fn update_recurse(
    tx: &mut WriteAlloc,
    r: Ref,
    key: i64,
    slot: usize,
    kind: ColumnKind,
    f: impl FnOnce(&mut ColumnData, usize) -> Result<()>,
) -> Result<Ref> {
    let header = node_header(tx, r)?;
    if header.is_inner_bptree() {
        let slots = Array::load(tx, r)?;
        let first_keys = Array::load(tx, slots.get(0) as Ref)?.values;
        let child_idx = select_child(&first_keys, key);
        let child = slots.get(2 + child_idx) as Ref;
        let new_child = update_recurse(tx, child, key, slot, kind, f)?;
        // Counts and first keys are unchanged by a cell update; only the
        // child ref slot moves.
        let mut new_slots = slots.clone();
        new_slots.set(2 + child_idx, new_child as i64);
        let new_ref = new_slots.store(tx)?;
        tx.free_node(r)?;
        return Ok(new_ref);
    }

    let slots = Array::load(tx, r)?;
    let keys_ref = slots.get(0) as Ref;
    let keys = Array::load(tx, keys_ref)?;
    let pos = match keys.values.binary_search(&key) {
        Ok(pos) => pos,
        Err(_) => {
            return Err(err(ErrorKind::LogicError(format!(
                "object key {} does not exist",
                key
            ))))
        }
    };
    let old_col = slots.get(1 + slot) as Ref;
    if old_col == 0 {
        return Err(err(ErrorKind::LogicError(format!(
            "column slot {} has been removed",
            slot
        ))));
    }
    let mut data = ColumnData::load(tx, old_col, kind)?;
    f(&mut data, pos)?;
    let new_col = data.store(tx)?;
    ColumnData::free_stored(tx, old_col, kind)?;
    let mut new_slots = slots.clone();
    new_slots.set(1 + slot, new_col as i64);
    let new_ref = new_slots.store(tx)?;
    tx.free_node(r)?;
    Ok(new_ref)
}

/// Appends a column slot across every cluster, filled with defaults.
pub fn add_column(tx: &mut WriteAlloc, root: Ref, kind: ColumnKind) -> Result<Ref> {
    let header = node_header(tx, root)?;
    if header.is_inner_bptree() {
        let (_, mut children) = load_inner(tx, root)?;
        free_inner_shell(tx, root)?;
        for child in &mut children {
            *child = add_column(tx, *child, kind)?;
        }
        return store_inner(tx, &children);
    }
    let (keys_ref, mut col_refs) = load_leaf(tx, root)?;
    let n = Array::size_direct(tx, keys_ref)?;
    let mut data = ColumnData::new_empty(kind);
    for i in 0..n {
        data.insert_default(i);
    }
    col_refs.push(data.store(tx)?);
    tx.free_node(root)?;
    store_leaf(tx, keys_ref, &col_refs)
}

/// Tombstones a column slot across every cluster, deep-freeing its content.
pub fn remove_column(tx: &mut WriteAlloc, root: Ref, slot: usize, kind: ColumnKind) -> Result<Ref> {
    let header = node_header(tx, root)?;
    if header.is_inner_bptree() {
        let (_, mut children) = load_inner(tx, root)?;
        free_inner_shell(tx, root)?;
        for child in &mut children {
            *child = remove_column(tx, *child, slot, kind)?;
        }
        return store_inner(tx, &children);
    }
    let (keys_ref, mut col_refs) = load_leaf(tx, root)?;
    let old_col = col_refs[slot];
    if old_col != 0 {
        match kind {
            ColumnKind::Refs | ColumnKind::Backlinks => {
                let values = Array::load(tx, old_col)?.values;
                for v in values {
                    if v != 0 && !is_tagged(v) {
                        free_tree(tx, v as Ref)?;
                    }
                }
                tx.free_node(old_col)?;
            }
            _ => ColumnData::free_stored(tx, old_col, kind)?,
        }
        col_refs[slot] = 0;
    }
    tx.free_node(root)?;
    store_leaf(tx, keys_ref, &col_refs)
}

/// Visits every key in ascending order.
pub fn for_each_key<A: Allocator + ?Sized>(
    alloc: &A,
    root: Ref,
    f: &mut impl FnMut(i64) -> Result<()>,
) -> Result<()> {
    let header = node_header(alloc, root)?;
    if header.is_inner_bptree() {
        let (_, children) = load_inner(alloc, root)?;
        for child in children {
            for_each_key(alloc, child, f)?;
        }
        return Ok(());
    }
    let keys_ref = Array::get_direct(alloc, root, 0)? as Ref;
    for key in Array::load(alloc, keys_ref)?.values {
        f(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FileMap, SlabAlloc, FILE_HEADER_SIZE};

    fn slab() -> std::sync::Arc<SlabAlloc> {
        std::sync::Arc::new(SlabAlloc::new(FileMap::new_mem().unwrap()))
    }

    fn txn(slab: &std::sync::Arc<SlabAlloc>) -> WriteAlloc {
        WriteAlloc::new(slab.clone(), FILE_HEADER_SIZE as u64, Vec::new())
    }

    const KINDS: &[Option<ColumnKind>] = &[Some(ColumnKind::Ints), Some(ColumnKind::Blobs)];

    #[test]
    fn empty_tree_has_no_objects() {
        let slab = slab();
        let mut tx = txn(&slab);
        let root = create_empty(&mut tx, KINDS).unwrap();
        assert_eq!(size(&tx, root).unwrap(), 0);
        assert!(!is_valid_key(&tx, root, 1).unwrap());
    }

    #[test]
    fn insert_lookup_erase() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        for key in [5i64, 1, 3] {
            root = insert_key(&mut tx, root, key, KINDS).unwrap();
        }
        assert_eq!(size(&tx, root).unwrap(), 3);
        assert!(is_valid_key(&tx, root, 3).unwrap());
        let (leaf, idx) = lookup(&tx, root, 3).unwrap().unwrap();
        assert_eq!(idx, 1); // sorted position
        assert_ne!(col_ref(&tx, leaf, 0).unwrap(), 0);

        root = erase_key(&mut tx, root, 3, KINDS).unwrap();
        assert!(!is_valid_key(&tx, root, 3).unwrap());
        assert_eq!(size(&tx, root).unwrap(), 2);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        root = insert_key(&mut tx, root, 7, KINDS).unwrap();
        assert!(insert_key(&mut tx, root, 7, KINDS).is_err());
    }

    #[test]
    fn erase_missing_key_is_rejected() {
        let slab = slab();
        let mut tx = txn(&slab);
        let root = create_empty(&mut tx, KINDS).unwrap();
        assert!(erase_key(&mut tx, root, 9, KINDS).is_err());
    }

    #[test]
    fn grows_past_cluster_capacity() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        let n = (MAX_CLUSTER_SIZE * 3) as i64;
        for key in 0..n {
            root = insert_key(&mut tx, root, key, KINDS).unwrap();
        }
        assert_eq!(size(&tx, root).unwrap(), n as usize);
        assert!(node_header(&tx, root).unwrap().is_inner_bptree());
        for key in [0, 255, 256, 300, n - 1] {
            assert!(is_valid_key(&tx, root, key).unwrap(), "key {}", key);
        }
    }

    #[test]
    fn keys_enumerate_in_order() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        for key in [400i64, 2, 77, 300, 1] {
            root = insert_key(&mut tx, root, key, KINDS).unwrap();
        }
        let mut seen = Vec::new();
        for_each_key(&tx, root, &mut |k| {
            seen.push(k);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2, 77, 300, 400]);
    }

    #[test]
    fn update_cell_rewrites_value() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        root = insert_key(&mut tx, root, 10, KINDS).unwrap();
        root = update_cell(&mut tx, root, 10, 0, ColumnKind::Ints, |data, idx| {
            match data {
                ColumnData::Ints(v) => v[idx] = Some(42),
                _ => unreachable!(),
            }
            Ok(())
        })
        .unwrap();
        let (leaf, idx) = lookup(&tx, root, 10).unwrap().unwrap();
        let cr = col_ref(&tx, leaf, 0).unwrap();
        let data = ColumnData::load(&tx, cr, ColumnKind::Ints).unwrap();
        match data {
            ColumnData::Ints(v) => assert_eq!(v[idx], Some(42)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn add_column_reaches_every_cluster() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        let n = (MAX_CLUSTER_SIZE + 10) as i64;
        for key in 0..n {
            root = insert_key(&mut tx, root, key, KINDS).unwrap();
        }
        root = add_column(&mut tx, root, ColumnKind::Keys).unwrap();
        for key in [0, n - 1] {
            let (leaf, _) = lookup(&tx, root, key).unwrap().unwrap();
            let cr = col_ref(&tx, leaf, 2).unwrap();
            assert_ne!(cr, 0);
            let data = ColumnData::load(&tx, cr, ColumnKind::Keys).unwrap();
            assert!(data.len() > 0);
        }
    }

    #[test]
    fn remove_column_tombstones_slot() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        root = insert_key(&mut tx, root, 1, KINDS).unwrap();
        root = remove_column(&mut tx, root, 1, ColumnKind::Blobs).unwrap();
        let (leaf, _) = lookup(&tx, root, 1).unwrap().unwrap();
        assert_eq!(col_ref(&tx, leaf, 1).unwrap(), 0);
        // Remaining columns still usable.
        assert_ne!(col_ref(&tx, leaf, 0).unwrap(), 0);
    }

    #[test]
    fn erase_all_objects_leaves_usable_tree() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create_empty(&mut tx, KINDS).unwrap();
        for key in 0..10i64 {
            root = insert_key(&mut tx, root, key, KINDS).unwrap();
        }
        for key in 0..10i64 {
            root = erase_key(&mut tx, root, key, KINDS).unwrap();
        }
        assert_eq!(size(&tx, root).unwrap(), 0);
        root = insert_key(&mut tx, root, 99, KINDS).unwrap();
        assert!(is_valid_key(&tx, root, 99).unwrap());
    }
}
