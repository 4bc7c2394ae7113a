//! # Array Nodes
//!
//! Polymorphic inline storage. Every container in the file is ultimately an
//! array node: a header (see [`crate::node`]) followed by a bit-packed
//! payload. This module covers the integer-family arrays; variable-sized
//! payloads (strings, binaries) live in [`blobs`] as an offsets-plus-blob
//! composite.
//!
//! ## Mutation Model
//!
//! Committed nodes are immutable. Mutation loads a node into an owned
//! in-memory form, applies the change, stores the result into freshly
//! allocated space and frees the old node through the transaction allocator
//! (which tags it for reclamation once no reader can see it). Readers use
//! the `*_direct` accessors, which decode single elements straight out of
//! the mapped payload without copying the node.
//!
//! ## Ref Slots
//!
//! Arrays with the `has_refs` flag form the structural tree of a version.
//! In such arrays an even value is a ref (or 0 for null) and an odd value
//! is a tagged 63-bit integer, `(v << 1) | 1`.

pub mod blobs;

use eyre::Result;

use crate::alloc::{node_header, node_payload, Allocator, Ref, WriteAlloc};
use crate::error::{err, ErrorKind};
use crate::node::{
    get_packed, max_width, payload_bytes, set_packed, width_for, NodeHeader, FLAG_HAS_REFS,
};

/// Tags a 63-bit integer for storage in a ref slot.
pub fn tag_int(v: i64) -> i64 {
    (v << 1) | 1
}

pub fn untag_int(v: i64) -> i64 {
    v >> 1
}

pub fn is_tagged(v: i64) -> bool {
    v & 1 == 1
}

/// Owned, decoded integer array.
#[derive(Debug, Clone)]
pub struct Array {
    pub flags: u8,
    pub values: Vec<i64>,
}

impl Array {
    pub fn new(flags: u8) -> Self {
        Self {
            flags,
            values: Vec::new(),
        }
    }

    pub fn from_values(flags: u8, values: Vec<i64>) -> Self {
        Self { flags, values }
    }

    pub fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Self> {
        let (header, payload) = node_payload(alloc, r)?;
        let mut values = Vec::with_capacity(header.size);
        for i in 0..header.size {
            values.push(get_packed(payload, header.width, i));
        }
        Ok(Self {
            flags: header.flags,
            values,
        })
    }

    /// Writes the array with the minimal width covering its values.
    pub fn store(&self, tx: &mut WriteAlloc) -> Result<Ref> {
        self.store_with_min_width(tx, 0)
    }

    /// Writes the array forcing at least `min_width` bits per element, so
    /// callers can later patch elements in place without a width change.
    pub fn store_with_min_width(&self, tx: &mut WriteAlloc, min_width: u8) -> Result<Ref> {
        let mut width = min_width;
        for &v in &self.values {
            width = max_width(width, width_for(v));
        }
        let mut payload = vec![0u8; payload_bytes(self.values.len(), width)];
        for (i, &v) in self.values.iter().enumerate() {
            set_packed(&mut payload, width, i, v);
        }
        let header = NodeHeader::new(self.flags, self.values.len(), 0, width);
        tx.write_node(header, &payload)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> i64 {
        self.values[idx]
    }

    pub fn set(&mut self, idx: usize, v: i64) {
        self.values[idx] = v;
    }

    pub fn insert(&mut self, idx: usize, v: i64) {
        self.values.insert(idx, v);
    }

    pub fn erase(&mut self, idx: usize) -> i64 {
        self.values.remove(idx)
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn minimum(&self) -> Option<i64> {
        self.values.iter().copied().min()
    }

    pub fn maximum(&self) -> Option<i64> {
        self.values.iter().copied().max()
    }

    pub fn sum(&self) -> i64 {
        self.values.iter().copied().fold(0i64, i64::wrapping_add)
    }

    // Direct (zero-copy) accessors.

    pub fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
        Ok(node_header(alloc, r)?.size)
    }

    pub fn get_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref, idx: usize) -> Result<i64> {
        let (header, payload) = node_payload(alloc, r)?;
        if idx >= header.size {
            return Err(err(ErrorKind::LogicError(format!(
                "array index {} out of range (size {})",
                idx, header.size
            ))));
        }
        Ok(get_packed(payload, header.width, idx))
    }
}

/// Nullable integer array. The stored form prefixes the payload with a
/// sentinel element at index 0 chosen to collide with no live value; a
/// stored element equal to the sentinel reads back as null.
#[derive(Debug, Clone, Default)]
pub struct ArrayIntNull {
    pub values: Vec<Option<i64>>,
}

impl ArrayIntNull {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Vec<Option<i64>>) -> Self {
        Self { values }
    }

    pub fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Self> {
        let raw = Array::load(alloc, r)?;
        if raw.values.is_empty() {
            return Err(err(ErrorKind::InvalidDatabase(
                "nullable array node missing its sentinel".into(),
            )));
        }
        let sentinel = raw.values[0];
        let values = raw.values[1..]
            .iter()
            .map(|&v| if v == sentinel { None } else { Some(v) })
            .collect();
        Ok(Self { values })
    }

    pub fn store(&self, tx: &mut WriteAlloc) -> Result<Ref> {
        let sentinel = self.pick_sentinel();
        let mut raw = Vec::with_capacity(self.values.len() + 1);
        raw.push(sentinel);
        for v in &self.values {
            raw.push(v.unwrap_or(sentinel));
        }
        Array::from_values(0, raw).store(tx)
    }

    fn pick_sentinel(&self) -> i64 {
        let mut candidate = i64::MIN;
        while self.values.contains(&Some(candidate)) {
            candidate += 1;
        }
        candidate
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
        let n = Array::size_direct(alloc, r)?;
        if n == 0 {
            return Err(err(ErrorKind::InvalidDatabase(
                "nullable array node missing its sentinel".into(),
            )));
        }
        Ok(n - 1)
    }

    pub fn get_direct<A: Allocator + ?Sized>(
        alloc: &A,
        r: Ref,
        idx: usize,
    ) -> Result<Option<i64>> {
        let (header, payload) = node_payload(alloc, r)?;
        if idx + 1 >= header.size {
            return Err(err(ErrorKind::LogicError(format!(
                "array index {} out of range (size {})",
                idx,
                header.size.saturating_sub(1)
            ))));
        }
        let sentinel = get_packed(payload, header.width, 0);
        let v = get_packed(payload, header.width, idx + 1);
        Ok(if v == sentinel { None } else { Some(v) })
    }

    pub fn minimum(&self) -> Option<i64> {
        self.values.iter().flatten().copied().min()
    }

    pub fn maximum(&self) -> Option<i64> {
        self.values.iter().flatten().copied().max()
    }

    pub fn sum(&self) -> i64 {
        self.values.iter().flatten().copied().fold(0, i64::wrapping_add)
    }
}

/// Frees the node at `r` and, when it has refs, every node reachable from
/// its even non-zero slots. Callers must only use this on subtrees whose
/// children are exclusively owned by the node being freed.
pub fn free_tree(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
    if r == 0 {
        return Ok(());
    }
    let header = node_header(tx, r)?;
    if header.flags & FLAG_HAS_REFS != 0 {
        let children = Array::load(tx, r)?;
        for &slot in &children.values {
            if slot != 0 && !is_tagged(slot) {
                free_tree(tx, slot as Ref)?;
            }
        }
    }
    tx.free_node(r)
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
    fn store_load_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let array = Array::from_values(0, vec![0, 1, -5, 300, i64::MAX]);
        let r = array.store(&mut tx).unwrap();
        let back = Array::load(&tx, r).unwrap();
        assert_eq!(back.values, array.values);
    }

    #[test]
    fn empty_array_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let r = Array::new(0).store(&mut tx).unwrap();
        let back = Array::load(&tx, r).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn small_values_pack_narrow() {
        let slab = slab();
        let mut tx = txn(&slab);
        let r = Array::from_values(0, vec![0, 1, 1, 0]).store(&mut tx).unwrap();
        let header = node_header(&tx, r).unwrap();
        assert_eq!(header.width, 1);
    }

    #[test]
    fn get_direct_matches_load() {
        let slab = slab();
        let mut tx = txn(&slab);
        let values = vec![7, -9, 1000, 0];
        let r = Array::from_values(0, values.clone()).store(&mut tx).unwrap();
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(Array::get_direct(&tx, r, i).unwrap(), v);
        }
        assert!(Array::get_direct(&tx, r, 4).is_err());
    }

    #[test]
    fn mutation_is_load_store_free() {
        let slab = slab();
        let mut tx = txn(&slab);
        let r = Array::from_values(0, vec![1, 2, 3]).store(&mut tx).unwrap();
        let mut a = Array::load(&tx, r).unwrap();
        a.insert(0, 99);
        let r2 = a.store(&mut tx).unwrap();
        tx.free_node(r).unwrap();
        assert_ne!(r, r2);
        let back = Array::load(&tx, r2).unwrap();
        assert_eq!(back.values, vec![99, 1, 2, 3]);
    }

    #[test]
    fn aggregates() {
        let a = Array::from_values(0, vec![3, -1, 7]);
        assert_eq!(a.minimum(), Some(-1));
        assert_eq!(a.maximum(), Some(7));
        assert_eq!(a.sum(), 9);
    }

    #[test]
    fn tagged_ints_roundtrip() {
        let v = 1234567;
        assert!(is_tagged(tag_int(v)));
        assert_eq!(untag_int(tag_int(v)), v);
        assert_eq!(untag_int(tag_int(-7)), -7);
    }

    #[test]
    fn int_null_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let values = vec![Some(1), None, Some(-3), None, Some(0)];
        let r = ArrayIntNull::from_values(values.clone())
            .store(&mut tx)
            .unwrap();
        let back = ArrayIntNull::load(&tx, r).unwrap();
        assert_eq!(back.values, values);
        assert_eq!(ArrayIntNull::size_direct(&tx, r).unwrap(), 5);
        assert_eq!(ArrayIntNull::get_direct(&tx, r, 1).unwrap(), None);
        assert_eq!(ArrayIntNull::get_direct(&tx, r, 2).unwrap(), Some(-3));
    }

    #[test]
    fn int_null_sentinel_avoids_live_values() {
        let slab = slab();
        let mut tx = txn(&slab);
        // Force a collision with the default sentinel candidate.
        let values = vec![Some(i64::MIN), None, Some(i64::MIN + 1)];
        let r = ArrayIntNull::from_values(values.clone())
            .store(&mut tx)
            .unwrap();
        let back = ArrayIntNull::load(&tx, r).unwrap();
        assert_eq!(back.values, values);
    }

    #[test]
    fn int_null_aggregates_skip_nulls() {
        let a = ArrayIntNull::from_values(vec![Some(5), None, Some(-2)]);
        assert_eq!(a.minimum(), Some(-2));
        assert_eq!(a.maximum(), Some(5));
        assert_eq!(a.sum(), 3);
    }

    #[test]
    fn free_tree_walks_ref_slots() {
        let slab = slab();
        let mut tx = txn(&slab);
        let child = Array::from_values(0, vec![1, 2]).store(&mut tx).unwrap();
        let parent = Array::from_values(
            FLAG_HAS_REFS,
            vec![child as i64, 0, tag_int(77)],
        )
        .store(&mut tx)
        .unwrap();
        free_tree(&mut tx, parent).unwrap();
        // Both nodes went through the freed list.
        let (_, _, freed, _) = tx.into_commit_parts();
        assert_eq!(freed.len(), 2);
    }
}
