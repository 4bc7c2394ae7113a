//! # Slab Allocator
//!
//! Ref-addressable node storage over the file map. Two allocator views:
//!
//! - [`SlabAlloc`] is the database-wide view: the file map plus the
//!   version-tagged free list. Read transactions translate refs through it
//!   directly; everything they can reach is committed and immutable.
//! - [`WriteAlloc`] is the per-write-transaction view. New nodes live either
//!   in the transaction's tail arena (refs at or past the logical file size
//!   at transaction start) or in shadow buffers occupying reclaimed free
//!   blocks (refs below the base, invisible to every live reader). Nothing
//!   touches the file until commit, so rollback is simply dropping the
//!   `WriteAlloc`.
//!
//! ## Copy-on-Write
//!
//! Mutating a node that a committed version can reach first clones it into
//! freshly allocated space; the old range goes on the transaction's freed
//! list, tagged at commit with the new version so it is recycled only after
//! every reader that could see it has moved on.
//!
//! ## Ref Discipline
//!
//! Refs are byte offsets, 8-aligned, never zero (offset 0 is the file
//! header). A node's footprint is its 8-byte header plus its capacity, so
//! freeing needs no size table.

mod file_map;
mod freelist;

pub use file_map::{FileHeader, FileMap, FILE_HEADER_SIZE, FILE_MAGIC};
pub use freelist::{FreeBlock, FreeList};

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::error::{err, ErrorKind};
use crate::node::{payload_bytes, NodeHeader, NODE_HEADER_SIZE};

pub type Ref = u64;

const ALLOC_ALIGN: u64 = 8;
/// A reclaimed block is split when the remainder would be at least this big.
const MIN_SPLIT: u64 = 24;

pub trait Allocator {
    fn translate(&self, r: Ref, len: usize) -> Result<&[u8]>;
}

/// Reads and validates the header of the node at `r`.
pub fn node_header<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<NodeHeader> {
    if r == 0 {
        return Err(err(ErrorKind::InvalidDatabase("null ref dereferenced".into())));
    }
    NodeHeader::decode(alloc.translate(r, NODE_HEADER_SIZE)?)
}

/// Reads the header and the used payload of the node at `r`.
pub fn node_payload<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<(NodeHeader, &[u8])> {
    let header = node_header(alloc, r)?;
    let len = payload_bytes(header.size, header.width);
    let payload = alloc.translate(r + NODE_HEADER_SIZE as u64, len)?;
    Ok((header, payload))
}

pub struct SlabAlloc {
    map: FileMap,
    free: Mutex<FreeList>,
}

impl SlabAlloc {
    pub fn new(map: FileMap) -> Self {
        Self {
            map,
            free: Mutex::new(FreeList::new()),
        }
    }

    pub fn map(&self) -> &FileMap {
        &self.map
    }

    pub fn replace_free_list(&self, list: FreeList) {
        *self.free.lock() = list;
    }

    pub fn with_free_list<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        f(&mut self.free.lock())
    }
}

impl Allocator for SlabAlloc {
    fn translate(&self, r: Ref, len: usize) -> Result<&[u8]> {
        self.map.slice(r, len)
    }
}

/// Per-write-transaction allocator.
pub struct WriteAlloc {
    file: Arc<SlabAlloc>,
    /// Logical file size at transaction start. Refs at or past this point
    /// are tail allocations of this transaction.
    base: u64,
    tail: Vec<u8>,
    /// Reclaimed-block allocations below `base`, keyed by their ref.
    shadow: BTreeMap<Ref, Box<[u8]>>,
    /// Blocks handed over from the free list at transaction start.
    reusable: Vec<FreeBlock>,
    /// Blocks freed by this transaction out of committed versions; tagged
    /// with the new version number at commit.
    freed: Vec<FreeBlock>,
}

impl WriteAlloc {
    pub fn new(file: Arc<SlabAlloc>, base: u64, reusable: Vec<FreeBlock>) -> Self {
        debug_assert!(base >= FILE_HEADER_SIZE as u64);
        debug_assert_eq!(base % ALLOC_ALIGN, 0);
        Self {
            file,
            base,
            tail: Vec::new(),
            shadow: BTreeMap::new(),
            reusable,
            freed: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Logical size of the file image as of now: base plus the tail arena.
    pub fn logical_size(&self) -> u64 {
        self.base + self.tail.len() as u64
    }

    pub fn is_txn_ref(&self, r: Ref) -> bool {
        r >= self.base || self.shadow.contains_key(&r)
    }

    /// Returns `(ref, actual_len)`; an unsplit reclaimed block may be
    /// larger than requested.
    fn alloc_raw(&mut self, size: u64) -> (Ref, u64) {
        debug_assert_eq!(size % ALLOC_ALIGN, 0);

        // First fit from the reclaimed blocks.
        for i in 0..self.reusable.len() {
            if self.reusable[i].len >= size {
                let block = self.reusable[i];
                let len = if block.len >= size + MIN_SPLIT {
                    self.reusable[i].pos += size;
                    self.reusable[i].len -= size;
                    size
                } else {
                    self.reusable.swap_remove(i);
                    block.len
                };
                if block.pos < self.base {
                    self.shadow
                        .insert(block.pos, vec![0u8; len as usize].into_boxed_slice());
                }
                return (block.pos, len);
            }
        }

        // Otherwise append to the tail arena.
        let r = self.base + self.tail.len() as u64;
        self.tail.resize(self.tail.len() + size as usize, 0);
        (r, size)
    }

    /// Writes a node (header + payload) into fresh space and returns its ref.
    /// The header's capacity is adjusted to the allocated footprint.
    pub fn write_node(&mut self, mut header: NodeHeader, payload: &[u8]) -> Result<Ref> {
        let need = (NODE_HEADER_SIZE + payload.len()) as u64;
        if payload.len() >= 1 << 24 {
            return Err(err(ErrorKind::LogicError(format!(
                "node payload of {} bytes exceeds the 16 MiB node limit",
                payload.len()
            ))));
        }
        let want = need.div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        let (r, size) = self.alloc_raw(want);

        header.capacity = (size as usize) - NODE_HEADER_SIZE;
        let buf = self.raw_buf_mut(r, size as usize)?;
        header.encode(&mut buf[..NODE_HEADER_SIZE]);
        buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        for b in &mut buf[NODE_HEADER_SIZE + payload.len()..] {
            *b = 0;
        }
        Ok(r)
    }

    /// Frees the node at `r` (footprint derived from its header).
    pub fn free_node(&mut self, r: Ref) -> Result<()> {
        let header = node_header(self, r)?;
        let total = header.node_bytes() as u64;
        let size = total.div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        self.free_block(r, size);
        Ok(())
    }

    pub fn free_block(&mut self, r: Ref, len: u64) {
        if let Some(buf) = self.shadow.remove(&r) {
            debug_assert_eq!(buf.len() as u64, len);
            self.reusable.push(FreeBlock {
                pos: r,
                len,
                version: 0,
            });
        } else {
            // Tail allocations of this transaction were never visible to a
            // reader, but their space is still accounted through the freed
            // list so a later transaction can recycle it.
            self.freed.push(FreeBlock {
                pos: r,
                len,
                version: 0,
            });
        }
    }

    /// Mutable access to a whole raw allocation owned by this transaction.
    fn raw_buf_mut(&mut self, r: Ref, len: usize) -> Result<&mut [u8]> {
        if let Some(buf) = self.shadow.get_mut(&r) {
            return Ok(&mut buf[..len]);
        }
        if r >= self.base {
            let off = (r - self.base) as usize;
            if off + len <= self.tail.len() {
                return Ok(&mut self.tail[off..off + len]);
            }
        }
        Err(err(ErrorKind::InvalidDatabase(format!(
            "ref {} is not writable by this transaction",
            r
        ))))
    }

    /// In-place update of one width-64 element of a node owned by this
    /// transaction. Used to patch the group top after its size is known.
    pub fn patch_node_value(&mut self, r: Ref, idx: usize, value: i64) -> Result<()> {
        let header = node_header(self, r)?;
        if header.width != 64 || idx >= header.size {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "patch of node {} at {} outside width-64 payload",
                r, idx
            ))));
        }
        let total = header.node_bytes();
        let buf = self.raw_buf_mut(r, total)?;
        let off = NODE_HEADER_SIZE + idx * 8;
        buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Removes and returns the blocks freed so far (the committer tags
    /// them with the new version before persisting the free list).
    pub fn drain_freed(&mut self) -> Vec<FreeBlock> {
        std::mem::take(&mut self.freed)
    }

    /// Removes and returns the reclaimed blocks not consumed by this
    /// transaction; later allocations fall back to the tail arena.
    pub fn drain_reusable(&mut self) -> Vec<FreeBlock> {
        std::mem::take(&mut self.reusable)
    }

    /// Tears the allocator apart for commit: tail arena, shadow blocks,
    /// blocks freed out of committed versions, and unused reclaimed blocks.
    pub fn into_commit_parts(
        self,
    ) -> (
        Vec<u8>,
        BTreeMap<Ref, Box<[u8]>>,
        Vec<FreeBlock>,
        Vec<FreeBlock>,
    ) {
        (self.tail, self.shadow, self.freed, self.reusable)
    }
}

impl Allocator for WriteAlloc {
    fn translate(&self, r: Ref, len: usize) -> Result<&[u8]> {
        // Shadow blocks are keyed by their start ref, but translation may
        // target an interior offset (e.g. a payload read).
        if let Some((&start, buf)) = self.shadow.range(..=r).next_back() {
            let end = start + buf.len() as u64;
            if r >= start && r < end {
                let off = (r - start) as usize;
                if off + len > buf.len() {
                    return Err(err(ErrorKind::InvalidDatabase(format!(
                        "read of {} bytes at ref {} crosses slab boundary",
                        len, r
                    ))));
                }
                return Ok(&buf[off..off + len]);
            }
        }
        if r >= self.base {
            let off = (r - self.base) as usize;
            if off + len > self.tail.len() {
                return Err(err(ErrorKind::InvalidDatabase(format!(
                    "read of {} bytes at ref {} beyond transaction arena",
                    len, r
                ))));
            }
            return Ok(&self.tail[off..off + len]);
        }
        self.file.translate(r, len)
    }
}
