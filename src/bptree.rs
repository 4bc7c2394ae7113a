//! # B+Tree
//!
//! Ordered sequence container over array nodes, parameterized by leaf
//! representation: integer leaves hold fixed-size scalars inline, byte
//! leaves hold variable-sized elements through the blob composite. Inner
//! nodes are shared between the two:
//!
//! ```text
//! inner (has_refs | inner_bptree): [counts_ref, child_0, child_1, ...]
//! counts: cumulative element counts per child subtree
//! ```
//!
//! The cumulative counts give O(log N) index-to-leaf descent. Leaves are
//! bounded at 1000 elements and split in half on overflow; erase removes
//! emptied leaves and collapses a single-child root. All mutation is
//! copy-on-write: every operation returns the tree's (possibly new) root
//! ref.
//!
//! Used for history changeset storage and for list columns; the cluster
//! tree keys objects with its own leaf layout but the same descent scheme.

use eyre::Result;

use crate::alloc::{node_header, Allocator, Ref, WriteAlloc};
use crate::array::blobs::ArrayBlobs;
use crate::array::Array;
use crate::error::{err, ErrorKind};

pub const MAX_LEAF_SIZE: usize = 1000;
pub const MAX_FANOUT: usize = 1000;

pub trait LeafCodec {
    type Value: Clone;

    fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Vec<Self::Value>>;
    fn store(tx: &mut WriteAlloc, values: &[Self::Value]) -> Result<Ref>;
    fn free(tx: &mut WriteAlloc, r: Ref) -> Result<()>;
    fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize>;
    fn get_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref, idx: usize) -> Result<Self::Value>;
}

/// Fixed-size scalar leaves (plain integer array).
pub struct IntLeaf;

impl LeafCodec for IntLeaf {
    type Value = i64;

    fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Vec<i64>> {
        Ok(Array::load(alloc, r)?.values)
    }

    fn store(tx: &mut WriteAlloc, values: &[i64]) -> Result<Ref> {
        Array::from_values(0, values.to_vec()).store(tx)
    }

    fn free(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
        tx.free_node(r)
    }

    fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
        Array::size_direct(alloc, r)
    }

    fn get_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref, idx: usize) -> Result<i64> {
        Array::get_direct(alloc, r, idx)
    }
}

/// Variable-sized element leaves (blob composite).
pub struct BytesLeaf;

impl LeafCodec for BytesLeaf {
    type Value = Option<Vec<u8>>;

    fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(ArrayBlobs::load(alloc, r)?.items)
    }

    fn store(tx: &mut WriteAlloc, values: &[Option<Vec<u8>>]) -> Result<Ref> {
        ArrayBlobs::from_items(values.to_vec()).store(tx)
    }

    fn free(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
        ArrayBlobs::free(tx, r)
    }

    fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
        ArrayBlobs::size_direct(alloc, r)
    }

    fn get_direct<A: Allocator + ?Sized>(
        alloc: &A,
        r: Ref,
        idx: usize,
    ) -> Result<Option<Vec<u8>>> {
        Ok(ArrayBlobs::get_direct(alloc, r, idx)?.map(|s| s.to_vec()))
    }
}

enum InsertOutcome {
    Updated(Ref),
    Split(Ref, Ref),
}

enum EraseOutcome {
    Updated(Ref),
    Emptied,
}

/// Creates an empty tree (a single empty leaf).
pub fn create<C: LeafCodec>(tx: &mut WriteAlloc) -> Result<Ref> {
    C::store(tx, &[])
}

pub fn len<C: LeafCodec, A: Allocator + ?Sized>(alloc: &A, root: Ref) -> Result<usize> {
    node_len::<C, A>(alloc, root)
}

fn node_len<C: LeafCodec, A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
    let header = node_header(alloc, r)?;
    if header.is_inner_bptree() {
        let counts_ref = Array::get_direct(alloc, r, 0)? as Ref;
        let n = Array::size_direct(alloc, counts_ref)?;
        if n == 0 {
            return Ok(0);
        }
        Ok(Array::get_direct(alloc, counts_ref, n - 1)? as usize)
    } else {
        C::size_direct(alloc, r)
    }
}

/// Finds the child holding element `idx`. With `for_insert`, an index equal
/// to the total count lands in the last child.
fn locate(cumulative: &[i64], idx: usize, for_insert: bool) -> Result<(usize, usize)> {
    let mut prev = 0usize;
    for (i, &c) in cumulative.iter().enumerate() {
        let c = c as usize;
        if idx < c || (for_insert && idx == c && i == cumulative.len() - 1) {
            return Ok((i, idx - prev));
        }
        prev = c;
    }
    Err(err(ErrorKind::LogicError(format!(
        "tree index {} out of range (size {})",
        idx,
        cumulative.last().copied().unwrap_or(0)
    ))))
}

fn store_inner<C: LeafCodec>(tx: &mut WriteAlloc, children: &[Ref]) -> Result<Ref> {
    let mut cumulative = Vec::with_capacity(children.len());
    let mut total = 0usize;
    for &child in children {
        total += node_len::<C, _>(tx, child)?;
        cumulative.push(total as i64);
    }
    let counts_ref = Array::from_values(0, cumulative).store(tx)?;
    let mut slots = Vec::with_capacity(children.len() + 1);
    slots.push(counts_ref as i64);
    slots.extend(children.iter().map(|&c| c as i64));
    Array::from_values(
        crate::node::FLAG_HAS_REFS | crate::node::FLAG_INNER_BPTREE,
        slots,
    )
    .store(tx)
}

fn load_children<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<(Vec<Ref>, Vec<i64>)> {
    let inner = Array::load(alloc, r)?;
    if inner.is_empty() {
        return Err(err(ErrorKind::InvalidDatabase(
            "inner tree node has no slots".into(),
        )));
    }
    let counts_ref = inner.get(0) as Ref;
    let counts = Array::load(alloc, counts_ref)?.values;
    let children = inner.values[1..].iter().map(|&v| v as Ref).collect();
    Ok((children, counts))
}

fn free_inner_shell(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
    let counts_ref = Array::get_direct(tx, r, 0)? as Ref;
    tx.free_node(counts_ref)?;
    tx.free_node(r)
}

pub fn get<C: LeafCodec, A: Allocator + ?Sized>(
    alloc: &A,
    root: Ref,
    idx: usize,
) -> Result<C::Value> {
    let mut r = root;
    let mut idx = idx;
    loop {
        let header = node_header(alloc, r)?;
        if !header.is_inner_bptree() {
            return C::get_direct(alloc, r, idx);
        }
        let (children, counts) = load_children(alloc, r)?;
        let (child, local) = locate(&counts, idx, false)?;
        r = children[child];
        idx = local;
    }
}

pub fn insert<C: LeafCodec>(
    tx: &mut WriteAlloc,
    root: Ref,
    idx: usize,
    value: C::Value,
) -> Result<Ref> {
    match insert_recurse::<C>(tx, root, idx, value)? {
        InsertOutcome::Updated(r) => Ok(r),
        InsertOutcome::Split(left, right) => store_inner::<C>(tx, &[left, right]),
    }
}

fn insert_recurse<C: LeafCodec>(
    tx: &mut WriteAlloc,
    r: Ref,
    idx: usize,
    value: C::Value,
) -> Result<InsertOutcome> {
    let header = node_header(tx, r)?;
    if !header.is_inner_bptree() {
        let mut values = C::load(tx, r)?;
        if idx > values.len() {
            return Err(err(ErrorKind::LogicError(format!(
                "tree insert at {} out of range (size {})",
                idx,
                values.len()
            ))));
        }
        values.insert(idx, value);
        C::free(tx, r)?;
        if values.len() <= MAX_LEAF_SIZE {
            return Ok(InsertOutcome::Updated(C::store(tx, &values)?));
        }
        let right = values.split_off(values.len() / 2);
        let left_ref = C::store(tx, &values)?;
        let right_ref = C::store(tx, &right)?;
        return Ok(InsertOutcome::Split(left_ref, right_ref));
    }

    let (mut children, counts) = load_children(tx, r)?;
    let (child, local) = locate(&counts, idx, true)?;
    let outcome = insert_recurse::<C>(tx, children[child], local, value)?;
    free_inner_shell(tx, r)?;
    match outcome {
        InsertOutcome::Updated(nr) => {
            children[child] = nr;
        }
        InsertOutcome::Split(left, right) => {
            children[child] = left;
            children.insert(child + 1, right);
        }
    }
    if children.len() <= MAX_FANOUT {
        Ok(InsertOutcome::Updated(store_inner::<C>(tx, &children)?))
    } else {
        let right = children.split_off(children.len() / 2);
        let left_ref = store_inner::<C>(tx, &children)?;
        let right_ref = store_inner::<C>(tx, &right)?;
        Ok(InsertOutcome::Split(left_ref, right_ref))
    }
}

pub fn push<C: LeafCodec>(tx: &mut WriteAlloc, root: Ref, value: C::Value) -> Result<Ref> {
    let n = len::<C, _>(tx, root)?;
    insert::<C>(tx, root, n, value)
}

pub fn set<C: LeafCodec>(
    tx: &mut WriteAlloc,
    root: Ref,
    idx: usize,
    value: C::Value,
) -> Result<Ref> {
    let header = node_header(tx, root)?;
    if !header.is_inner_bptree() {
        let mut values = C::load(tx, root)?;
        if idx >= values.len() {
            return Err(err(ErrorKind::LogicError(format!(
                "tree set at {} out of range (size {})",
                idx,
                values.len()
            ))));
        }
        values[idx] = value;
        C::free(tx, root)?;
        return C::store(tx, &values);
    }
    let (mut children, counts) = load_children(tx, root)?;
    let (child, local) = locate(&counts, idx, false)?;
    let new_child = set::<C>(tx, children[child], local, value)?;
    free_inner_shell(tx, root)?;
    children[child] = new_child;
    store_inner::<C>(tx, &children)
}

pub fn erase<C: LeafCodec>(tx: &mut WriteAlloc, root: Ref, idx: usize) -> Result<Ref> {
    match erase_recurse::<C>(tx, root, idx)? {
        EraseOutcome::Updated(mut r) => {
            // Collapse a single-child inner root.
            loop {
                let header = node_header(tx, r)?;
                if !header.is_inner_bptree() {
                    return Ok(r);
                }
                let (children, _) = load_children(tx, r)?;
                if children.len() != 1 {
                    return Ok(r);
                }
                free_inner_shell(tx, r)?;
                r = children[0];
            }
        }
        EraseOutcome::Emptied => create::<C>(tx),
    }
}

fn erase_recurse<C: LeafCodec>(tx: &mut WriteAlloc, r: Ref, idx: usize) -> Result<EraseOutcome> {
    let header = node_header(tx, r)?;
    if !header.is_inner_bptree() {
        let mut values = C::load(tx, r)?;
        if idx >= values.len() {
            return Err(err(ErrorKind::LogicError(format!(
                "tree erase at {} out of range (size {})",
                idx,
                values.len()
            ))));
        }
        values.remove(idx);
        C::free(tx, r)?;
        if values.is_empty() {
            return Ok(EraseOutcome::Emptied);
        }
        return Ok(EraseOutcome::Updated(C::store(tx, &values)?));
    }

    let (mut children, counts) = load_children(tx, r)?;
    let (child, local) = locate(&counts, idx, false)?;
    let outcome = erase_recurse::<C>(tx, children[child], local)?;
    free_inner_shell(tx, r)?;
    match outcome {
        EraseOutcome::Updated(nr) => children[child] = nr,
        EraseOutcome::Emptied => {
            children.remove(child);
        }
    }
    if children.is_empty() {
        return Ok(EraseOutcome::Emptied);
    }
    Ok(EraseOutcome::Updated(store_inner::<C>(tx, &children)?))
}

/// Frees the whole tree including leaf contents.
pub fn free<C: LeafCodec>(tx: &mut WriteAlloc, root: Ref) -> Result<()> {
    let header = node_header(tx, root)?;
    if !header.is_inner_bptree() {
        return C::free(tx, root);
    }
    let (children, _) = load_children(tx, root)?;
    for child in children {
        free::<C>(tx, child)?;
    }
    free_inner_shell(tx, root)
}

/// Frees the whole tree and creates a fresh empty one.
pub fn clear<C: LeafCodec>(tx: &mut WriteAlloc, root: Ref) -> Result<Ref> {
    free::<C>(tx, root)?;
    create::<C>(tx)
}

/// Forward scan over every element in order.
pub fn for_each<C: LeafCodec, A: Allocator + ?Sized>(
    alloc: &A,
    root: Ref,
    f: &mut impl FnMut(usize, C::Value) -> Result<()>,
) -> Result<()> {
    let mut next_index = 0usize;
    for_each_node::<C, A>(alloc, root, &mut next_index, f)
}

fn for_each_node<C: LeafCodec, A: Allocator + ?Sized>(
    alloc: &A,
    r: Ref,
    next_index: &mut usize,
    f: &mut impl FnMut(usize, C::Value) -> Result<()>,
) -> Result<()> {
    let header = node_header(alloc, r)?;
    if !header.is_inner_bptree() {
        for value in C::load(alloc, r)? {
            f(*next_index, value)?;
            *next_index += 1;
        }
        return Ok(());
    }
    let (children, _) = load_children(alloc, r)?;
    for child in children {
        for_each_node::<C, A>(alloc, child, next_index, f)?;
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

    #[test]
    fn empty_tree_has_len_zero() {
        let slab = slab();
        let mut tx = txn(&slab);
        let root = create::<IntLeaf>(&mut tx).unwrap();
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), 0);
    }

    #[test]
    fn push_and_get() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        for i in 0..10 {
            root = push::<IntLeaf>(&mut tx, root, i * 10).unwrap();
        }
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), 10);
        for i in 0..10 {
            assert_eq!(get::<IntLeaf, _>(&tx, root, i).unwrap(), (i as i64) * 10);
        }
    }

    #[test]
    fn insert_in_middle_shifts_elements() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        root = push::<IntLeaf>(&mut tx, root, 1).unwrap();
        root = push::<IntLeaf>(&mut tx, root, 3).unwrap();
        root = insert::<IntLeaf>(&mut tx, root, 1, 2).unwrap();
        let mut seen = Vec::new();
        for_each::<IntLeaf, _>(&tx, root, &mut |_, v| {
            seen.push(v);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn grows_past_leaf_capacity() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        let n = (MAX_LEAF_SIZE * 3) as i64;
        for i in 0..n {
            root = push::<IntLeaf>(&mut tx, root, i).unwrap();
        }
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), n as usize);
        // Root must be an inner node now.
        assert!(node_header(&tx, root).unwrap().is_inner_bptree());
        for i in [0, 999, 1000, 1500, n - 1] {
            assert_eq!(get::<IntLeaf, _>(&tx, root, i as usize).unwrap(), i);
        }
    }

    #[test]
    fn set_replaces_in_deep_tree() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        for i in 0..(MAX_LEAF_SIZE as i64 + 10) {
            root = push::<IntLeaf>(&mut tx, root, i).unwrap();
        }
        root = set::<IntLeaf>(&mut tx, root, 1003, -1).unwrap();
        assert_eq!(get::<IntLeaf, _>(&tx, root, 1003).unwrap(), -1);
        assert_eq!(get::<IntLeaf, _>(&tx, root, 1002).unwrap(), 1002);
    }

    #[test]
    fn erase_across_leaves_keeps_order() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        let n = MAX_LEAF_SIZE as i64 + 5;
        for i in 0..n {
            root = push::<IntLeaf>(&mut tx, root, i).unwrap();
        }
        root = erase::<IntLeaf>(&mut tx, root, 0).unwrap();
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), (n - 1) as usize);
        assert_eq!(get::<IntLeaf, _>(&tx, root, 0).unwrap(), 1);
    }

    #[test]
    fn erase_to_empty_leaves_valid_tree() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        for i in 0..5 {
            root = push::<IntLeaf>(&mut tx, root, i).unwrap();
        }
        for _ in 0..5 {
            root = erase::<IntLeaf>(&mut tx, root, 0).unwrap();
        }
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), 0);
        root = push::<IntLeaf>(&mut tx, root, 42).unwrap();
        assert_eq!(get::<IntLeaf, _>(&tx, root, 0).unwrap(), 42);
    }

    #[test]
    fn bytes_leaf_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<BytesLeaf>(&mut tx).unwrap();
        root = push::<BytesLeaf>(&mut tx, root, Some(b"first".to_vec())).unwrap();
        root = push::<BytesLeaf>(&mut tx, root, None).unwrap();
        root = push::<BytesLeaf>(&mut tx, root, Some(b"third".to_vec())).unwrap();
        assert_eq!(len::<BytesLeaf, _>(&tx, root).unwrap(), 3);
        assert_eq!(
            get::<BytesLeaf, _>(&tx, root, 0).unwrap(),
            Some(b"first".to_vec())
        );
        assert_eq!(get::<BytesLeaf, _>(&tx, root, 1).unwrap(), None);
    }

    #[test]
    fn clear_resets_tree() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut root = create::<IntLeaf>(&mut tx).unwrap();
        for i in 0..100 {
            root = push::<IntLeaf>(&mut tx, root, i).unwrap();
        }
        root = clear::<IntLeaf>(&mut tx, root).unwrap();
        assert_eq!(len::<IntLeaf, _>(&tx, root).unwrap(), 0);
    }

    #[test]
    fn out_of_range_access_fails() {
        let slab = slab();
        let mut tx = txn(&slab);
        let root = create::<IntLeaf>(&mut tx).unwrap();
        assert!(get::<IntLeaf, _>(&tx, root, 0).is_err());
        assert!(set::<IntLeaf>(&mut tx, root, 0, 1).is_err());
        assert!(erase::<IntLeaf>(&mut tx, root, 0).is_err());
    }
}
