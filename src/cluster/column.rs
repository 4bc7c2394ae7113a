//! # Cluster Column Storage
//!
//! A cluster stores one array node per table column, holding the values of
//! that column for every object in the cluster. Four physical layouts cover
//! all column types:
//!
//! | Kind      | Node layout                  | Column types                  |
//! |-----------|------------------------------|-------------------------------|
//! | Ints      | nullable int array           | Int, Bool, Float, Double      |
//! | Blobs     | blob composite               | String, Binary, Timestamp,    |
//! |           |                              | Decimal, ObjectId, Uuid, Mixed|
//! | Keys      | plain int array (key+1, 0=ø) | Link                          |
//! | Refs      | ref array (0 = no list)      | any list column               |
//! | Backlinks | ref array (0 / tagged key /  | backlink columns              |
//! |           | ref to key array)            |                               |
//!
//! Scalars are stored by bit pattern (floats as IEEE bits); blob kinds store
//! a fixed or self-describing byte encoding. Nullability of the Ints/Blobs
//! kinds is structural: a missing value reads back as the column default at
//! the table layer when the column is not nullable.

use eyre::Result;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::blobs::ArrayBlobs;
use crate::array::{free_tree, Array, ArrayIntNull};
use crate::node::FLAG_HAS_REFS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Ints,
    Blobs,
    Keys,
    Refs,
    Backlinks,
}

#[derive(Debug, Clone)]
pub enum ColumnData {
    Ints(Vec<Option<i64>>),
    Blobs(Vec<Option<Vec<u8>>>),
    Keys(Vec<i64>),
    Refs(Vec<i64>),
    Backlinks(Vec<i64>),
}

impl ColumnData {
    pub fn new_empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Ints => ColumnData::Ints(Vec::new()),
            ColumnKind::Blobs => ColumnData::Blobs(Vec::new()),
            ColumnKind::Keys => ColumnData::Keys(Vec::new()),
            ColumnKind::Refs => ColumnData::Refs(Vec::new()),
            ColumnKind::Backlinks => ColumnData::Backlinks(Vec::new()),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnData::Ints(_) => ColumnKind::Ints,
            ColumnData::Blobs(_) => ColumnKind::Blobs,
            ColumnData::Keys(_) => ColumnKind::Keys,
            ColumnData::Refs(_) => ColumnKind::Refs,
            ColumnData::Backlinks(_) => ColumnKind::Backlinks,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Ints(v) => v.len(),
            ColumnData::Blobs(v) => v.len(),
            ColumnData::Keys(v) | ColumnData::Refs(v) | ColumnData::Backlinks(v) => v.len(),
        }
    }

    pub fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref, kind: ColumnKind) -> Result<Self> {
        Ok(match kind {
            ColumnKind::Ints => ColumnData::Ints(ArrayIntNull::load(alloc, r)?.values),
            ColumnKind::Blobs => ColumnData::Blobs(ArrayBlobs::load(alloc, r)?.items),
            ColumnKind::Keys => ColumnData::Keys(Array::load(alloc, r)?.values),
            ColumnKind::Refs => ColumnData::Refs(Array::load(alloc, r)?.values),
            ColumnKind::Backlinks => ColumnData::Backlinks(Array::load(alloc, r)?.values),
        })
    }

    pub fn store(&self, tx: &mut WriteAlloc) -> Result<Ref> {
        match self {
            ColumnData::Ints(v) => ArrayIntNull::from_values(v.clone()).store(tx),
            ColumnData::Blobs(v) => ArrayBlobs::from_items(v.clone()).store(tx),
            ColumnData::Keys(v) => Array::from_values(0, v.clone()).store(tx),
            ColumnData::Refs(v) | ColumnData::Backlinks(v) => {
                Array::from_values(FLAG_HAS_REFS, v.clone()).store(tx)
            }
        }
    }

    /// Frees the stored node at `r`. For Blobs the children are owned and
    /// freed too; for ref-carrying kinds only the slot array itself goes
    /// (the referenced subtrees live on as values elsewhere or are freed
    /// explicitly by the caller).
    pub fn free_stored(tx: &mut WriteAlloc, r: Ref, kind: ColumnKind) -> Result<()> {
        match kind {
            ColumnKind::Blobs => free_tree(tx, r),
            _ => tx.free_node(r),
        }
    }

    /// Inserts the column default at `idx`.
    pub fn insert_default(&mut self, idx: usize) {
        match self {
            ColumnData::Ints(v) => v.insert(idx, None),
            ColumnData::Blobs(v) => v.insert(idx, None),
            ColumnData::Keys(v) | ColumnData::Refs(v) | ColumnData::Backlinks(v) => {
                v.insert(idx, 0)
            }
        }
    }

    /// Removes the value at `idx` without freeing anything it references.
    pub fn erase(&mut self, idx: usize) {
        match self {
            ColumnData::Ints(v) => {
                v.remove(idx);
            }
            ColumnData::Blobs(v) => {
                v.remove(idx);
            }
            ColumnData::Keys(v) | ColumnData::Refs(v) | ColumnData::Backlinks(v) => {
                v.remove(idx);
            }
        }
    }

    /// Splits the column at `mid`, returning the upper half.
    pub fn split_off(&mut self, mid: usize) -> ColumnData {
        match self {
            ColumnData::Ints(v) => ColumnData::Ints(v.split_off(mid)),
            ColumnData::Blobs(v) => ColumnData::Blobs(v.split_off(mid)),
            ColumnData::Keys(v) => ColumnData::Keys(v.split_off(mid)),
            ColumnData::Refs(v) => ColumnData::Refs(v.split_off(mid)),
            ColumnData::Backlinks(v) => ColumnData::Backlinks(v.split_off(mid)),
        }
    }
}
