//! # Variable-Sized Element Arrays
//!
//! Strings and binaries use a two-array layout: an offsets array holding the
//! end offset of every element inside a concatenated payload blob, plus an
//! optional-null bitmap. The composite is rooted in a three-slot ref array:
//!
//! ```text
//! top (has_refs): [offsets_ref, blob_ref, nulls_ref]
//! ```
//!
//! Insert and erase rewrite the composite; the offsets of the elements after
//! the edit point shift by the length delta. Element reads are zero-copy:
//! they slice the mapped blob payload directly.

use eyre::Result;

use crate::alloc::{node_payload, Allocator, Ref, WriteAlloc};
use crate::array::{free_tree, Array};
use crate::error::{err, ErrorKind};
use crate::node::{NodeHeader, FLAG_HAS_REFS};

/// Largest single string or binary element: 16 MiB - 1.
pub const MAX_BLOB_SIZE: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Default)]
pub struct ArrayBlobs {
    pub items: Vec<Option<Vec<u8>>>,
}

impl ArrayBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Option<Vec<u8>>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Self> {
        let top = Array::load(alloc, r)?;
        if top.len() != 3 {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "blob array top has {} slots",
                top.len()
            ))));
        }
        let offsets_ref = top.get(0) as Ref;
        let blob_ref = top.get(1) as Ref;
        let nulls_ref = top.get(2) as Ref;

        let offsets = if offsets_ref != 0 {
            Array::load(alloc, offsets_ref)?.values
        } else {
            Vec::new()
        };
        let blob: &[u8] = if blob_ref != 0 {
            node_payload(alloc, blob_ref)?.1
        } else {
            &[]
        };
        let nulls = if nulls_ref != 0 {
            Array::load(alloc, nulls_ref)?.values
        } else {
            vec![0; offsets.len()]
        };

        let mut items = Vec::with_capacity(offsets.len());
        let mut start = 0usize;
        for (i, &end) in offsets.iter().enumerate() {
            let end = end as usize;
            if end < start || end > blob.len() {
                return Err(err(ErrorKind::InvalidDatabase(
                    "blob offsets out of order".into(),
                )));
            }
            if nulls.get(i).copied().unwrap_or(0) != 0 {
                items.push(None);
            } else {
                items.push(Some(blob[start..end].to_vec()));
            }
            start = end;
        }
        Ok(Self { items })
    }

    pub fn store(&self, tx: &mut WriteAlloc) -> Result<Ref> {
        let mut offsets = Vec::with_capacity(self.items.len());
        let mut nulls = Vec::with_capacity(self.items.len());
        let mut blob = Vec::new();
        for item in &self.items {
            match item {
                Some(bytes) => {
                    blob.extend_from_slice(bytes);
                    nulls.push(0);
                }
                None => nulls.push(1),
            }
            offsets.push(blob.len() as i64);
        }

        let offsets_ref = Array::from_values(0, offsets).store(tx)?;
        let blob_ref = tx.write_node(NodeHeader::new(0, blob.len(), 0, 8), &blob)?;
        let nulls_ref = Array::from_values(0, nulls).store(tx)?;
        Array::from_values(
            FLAG_HAS_REFS,
            vec![offsets_ref as i64, blob_ref as i64, nulls_ref as i64],
        )
        .store(tx)
    }

    pub fn size_direct<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<usize> {
        let offsets_ref = Array::get_direct(alloc, r, 0)? as Ref;
        if offsets_ref == 0 {
            return Ok(0);
        }
        Array::size_direct(alloc, offsets_ref)
    }

    /// Zero-copy element read.
    pub fn get_direct<A: Allocator + ?Sized>(
        alloc: &A,
        r: Ref,
        idx: usize,
    ) -> Result<Option<&[u8]>> {
        let top = Array::load(alloc, r)?;
        if top.len() != 3 {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "blob array top has {} slots",
                top.len()
            ))));
        }
        let offsets_ref = top.get(0) as Ref;
        let blob_ref = top.get(1) as Ref;
        let nulls_ref = top.get(2) as Ref;

        let size = Array::size_direct(alloc, offsets_ref)?;
        if idx >= size {
            return Err(err(ErrorKind::LogicError(format!(
                "blob index {} out of range (size {})",
                idx, size
            ))));
        }
        if nulls_ref != 0 && Array::get_direct(alloc, nulls_ref, idx)? != 0 {
            return Ok(None);
        }
        let start = if idx == 0 {
            0
        } else {
            Array::get_direct(alloc, offsets_ref, idx - 1)? as usize
        };
        let end = Array::get_direct(alloc, offsets_ref, idx)? as usize;
        let blob = node_payload(alloc, blob_ref)?.1;
        if end < start || end > blob.len() {
            return Err(err(ErrorKind::InvalidDatabase(
                "blob offsets out of order".into(),
            )));
        }
        Ok(Some(&blob[start..end]))
    }

    /// Frees the composite (top and all three children).
    pub fn free(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
        free_tree(tx, r)
    }
}
