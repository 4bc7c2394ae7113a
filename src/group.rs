//! # Group
//!
//! The on-disk root of a version: the table directory plus bookkeeping
//! refs. The group top is a width-64 ref array so the logical-size slot can
//! be patched in place once the final size of a commit is known:
//!
//! ```text
//! slot  content
//! ----  ---------------------------------------------
//! 0     table names (blob composite; None = erased)
//! 1     table tops (ref array; 0 = erased)
//! 2     tagged logical file size
//! 3     free-list positions ref
//! 4     free-list lengths ref
//! 5     free-list versions ref
//! 6     tagged version number
//! 7     history ref (0 = no history yet)
//! ```
//!
//! Table keys are indices into the directory; erasing a table tombstones
//! its slot so keys stay stable. A `Group` is an in-memory handle: caches
//! the directory, tracks the current (possibly dirty) top ref during a
//! write transaction, and serializes back out at commit.

use eyre::Result;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::blobs::ArrayBlobs;
use crate::array::{is_tagged, tag_int, untag_int, Array};
use crate::error::{err, ErrorKind};
use crate::node::FLAG_HAS_REFS;
use crate::value::TableKey;

const SLOT_NAMES: usize = 0;
const SLOT_TABLES: usize = 1;
const SLOT_LOGICAL_SIZE: usize = 2;
const SLOT_FREE_POSITIONS: usize = 3;
const SLOT_FREE_LENGTHS: usize = 4;
const SLOT_FREE_VERSIONS: usize = 5;
const SLOT_VERSION: usize = 6;
const SLOT_HISTORY: usize = 7;
const TOP_SIZE: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct Group {
    /// Current top ref; 0 before the first commit ever.
    pub top: Ref,
    names: Vec<Option<String>>,
    tops: Vec<Ref>,
    pub version: u64,
    pub logical_size: u64,
    pub history: Ref,
    pub free_parts: (Vec<i64>, Vec<i64>, Vec<i64>),
}

impl Group {
    /// Parses the group at `top_ref`; a zero ref yields the empty group.
    pub fn attach<A: Allocator + ?Sized>(alloc: &A, top_ref: Ref) -> Result<Self> {
        if top_ref == 0 {
            return Ok(Self::default());
        }
        let top = Array::load(alloc, top_ref)?;
        if top.len() < TOP_SIZE {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "group top has {} slots",
                top.len()
            ))));
        }

        let names_ref = top.get(SLOT_NAMES) as Ref;
        let tables_ref = top.get(SLOT_TABLES) as Ref;
        let names_raw = if names_ref != 0 {
            ArrayBlobs::load(alloc, names_ref)?.items
        } else {
            Vec::new()
        };
        let tops = if tables_ref != 0 {
            Array::load(alloc, tables_ref)?
                .values
                .iter()
                .map(|&v| v as Ref)
                .collect()
        } else {
            Vec::new()
        };
        let mut names = Vec::with_capacity(names_raw.len());
        for raw in names_raw {
            match raw {
                Some(bytes) => names.push(Some(
                    String::from_utf8(bytes).map_err(|_| {
                        err(ErrorKind::InvalidDatabase("non-UTF-8 table name".into()))
                    })?,
                )),
                None => names.push(None),
            }
        }
        if names.len() != tops.len() {
            return Err(err(ErrorKind::InvalidDatabase(
                "table directory arrays disagree".into(),
            )));
        }

        let logical = top.get(SLOT_LOGICAL_SIZE);
        let version = top.get(SLOT_VERSION);
        if !is_tagged(logical) || !is_tagged(version) {
            return Err(err(ErrorKind::InvalidDatabase(
                "group top scalar slots are not tagged".into(),
            )));
        }

        let load_parts = |r: i64| -> Result<Vec<i64>> {
            if r == 0 {
                Ok(Vec::new())
            } else {
                Ok(Array::load(alloc, r as Ref)?.values)
            }
        };

        Ok(Self {
            top: top_ref,
            names,
            tops,
            version: untag_int(version) as u64,
            logical_size: untag_int(logical) as u64,
            history: top.get(SLOT_HISTORY) as Ref,
            free_parts: (
                load_parts(top.get(SLOT_FREE_POSITIONS))?,
                load_parts(top.get(SLOT_FREE_LENGTHS))?,
                load_parts(top.get(SLOT_FREE_VERSIONS))?,
            ),
        })
    }

    pub fn table_count(&self) -> usize {
        self.names.iter().flatten().count()
    }

    pub fn table_keys(&self) -> Vec<TableKey> {
        self.names
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| TableKey(i as u32)))
            .collect()
    }

    pub fn find_table(&self, name: &str) -> Option<TableKey> {
        self.names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .map(|i| TableKey(i as u32))
    }

    pub fn table_name(&self, key: TableKey) -> Result<&str> {
        self.names
            .get(key.0 as usize)
            .and_then(|n| n.as_deref())
            .ok_or_else(|| {
                err(ErrorKind::LogicError(format!(
                    "table key {} does not exist",
                    key.0
                )))
            })
    }

    pub fn table_top(&self, key: TableKey) -> Result<Ref> {
        let top = self.tops.get(key.0 as usize).copied().unwrap_or(0);
        if top == 0 {
            return Err(err(ErrorKind::LogicError(format!(
                "table key {} does not exist",
                key.0
            ))));
        }
        Ok(top)
    }

    pub fn has_table(&self, key: TableKey) -> bool {
        self.tops.get(key.0 as usize).copied().unwrap_or(0) != 0
    }

    /// Registers a table created by the table layer; returns its key.
    pub fn add_table_entry(&mut self, name: &str, table_top: Ref) -> Result<TableKey> {
        if self.find_table(name).is_some() {
            return Err(err(ErrorKind::LogicError(format!(
                "table '{}' already exists",
                name
            ))));
        }
        self.names.push(Some(name.to_owned()));
        self.tops.push(table_top);
        Ok(TableKey((self.names.len() - 1) as u32))
    }

    /// Registers a table at a specific key (changeset application).
    pub fn add_table_entry_at(&mut self, key: TableKey, name: &str, table_top: Ref) -> Result<()> {
        let idx = key.0 as usize;
        while self.names.len() <= idx {
            self.names.push(None);
            self.tops.push(0);
        }
        if self.tops[idx] != 0 {
            return Err(err(ErrorKind::LogicError(format!(
                "table key {} already in use",
                key.0
            ))));
        }
        self.names[idx] = Some(name.to_owned());
        self.tops[idx] = table_top;
        Ok(())
    }

    pub fn remove_table_entry(&mut self, key: TableKey) -> Result<Ref> {
        let idx = key.0 as usize;
        let top = self.table_top(key)?;
        self.names[idx] = None;
        self.tops[idx] = 0;
        Ok(top)
    }

    pub fn rename_table_entry(&mut self, key: TableKey, new_name: &str) -> Result<()> {
        if self.find_table(new_name).is_some() {
            return Err(err(ErrorKind::LogicError(format!(
                "table '{}' already exists",
                new_name
            ))));
        }
        let idx = key.0 as usize;
        if self.names.get(idx).map(|n| n.is_none()).unwrap_or(true) {
            return Err(err(ErrorKind::LogicError(format!(
                "table key {} does not exist",
                key.0
            ))));
        }
        self.names[idx] = Some(new_name.to_owned());
        Ok(())
    }

    pub fn set_table_top(&mut self, key: TableKey, table_top: Ref) -> Result<()> {
        let idx = key.0 as usize;
        if self.tops.get(idx).copied().unwrap_or(0) == 0 {
            return Err(err(ErrorKind::LogicError(format!(
                "table key {} does not exist",
                key.0
            ))));
        }
        self.tops[idx] = table_top;
        Ok(())
    }

    /// Frees the previous version's top and its bookkeeping arrays. The
    /// committer calls this before persisting the free list so the blocks
    /// are part of it; table tops and the history ref are shared across
    /// versions and freed by their own layers.
    pub fn free_previous_top(&mut self, tx: &mut WriteAlloc) -> Result<()> {
        if self.top == 0 {
            return Ok(());
        }
        let old = Array::load(tx, self.top)?;
        if old.get(SLOT_NAMES) != 0 {
            crate::array::free_tree(tx, old.get(SLOT_NAMES) as Ref)?;
        }
        for slot in [
            SLOT_TABLES,
            SLOT_FREE_POSITIONS,
            SLOT_FREE_LENGTHS,
            SLOT_FREE_VERSIONS,
        ] {
            if old.get(slot) != 0 {
                tx.free_node(old.get(slot) as Ref)?;
            }
        }
        tx.free_node(self.top)?;
        self.top = 0;
        Ok(())
    }

    /// Serializes the group for commit. The logical-size slot is written as
    /// a placeholder; the committer patches it once the final size is
    /// known (the top array is width-64 so the patch is in place).
    pub fn flush(
        &mut self,
        tx: &mut WriteAlloc,
        new_version: u64,
        free_parts: (Vec<i64>, Vec<i64>, Vec<i64>),
    ) -> Result<Ref> {
        let names_items: Vec<Option<Vec<u8>>> = self
            .names
            .iter()
            .map(|n| n.as_ref().map(|s| s.as_bytes().to_vec()))
            .collect();
        let names_ref = ArrayBlobs::from_items(names_items).store(tx)?;
        let tops_ref = Array::from_values(
            FLAG_HAS_REFS,
            self.tops.iter().map(|&r| r as i64).collect(),
        )
        .store(tx)?;
        let free_pos_ref = Array::from_values(0, free_parts.0).store(tx)?;
        let free_len_ref = Array::from_values(0, free_parts.1).store(tx)?;
        let free_ver_ref = Array::from_values(0, free_parts.2).store(tx)?;

        let mut slots = vec![0i64; TOP_SIZE];
        slots[SLOT_NAMES] = names_ref as i64;
        slots[SLOT_TABLES] = tops_ref as i64;
        slots[SLOT_LOGICAL_SIZE] = tag_int(0);
        slots[SLOT_FREE_POSITIONS] = free_pos_ref as i64;
        slots[SLOT_FREE_LENGTHS] = free_len_ref as i64;
        slots[SLOT_FREE_VERSIONS] = free_ver_ref as i64;
        slots[SLOT_VERSION] = tag_int(new_version as i64);
        slots[SLOT_HISTORY] = self.history as i64;

        let top_ref = Array::from_values(FLAG_HAS_REFS, slots).store_with_min_width(tx, 64)?;
        self.top = top_ref;
        self.version = new_version;
        Ok(top_ref)
    }

    /// Patches the logical-size slot of a freshly flushed top.
    pub fn patch_logical_size(&mut self, tx: &mut WriteAlloc, size: u64) -> Result<()> {
        self.logical_size = size;
        tx.patch_node_value(self.top, SLOT_LOGICAL_SIZE, tag_int(size as i64))
    }
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
    fn empty_group_from_null_ref() {
        let slab = slab();
        let tx = txn(&slab);
        let group = Group::attach(&tx, 0).unwrap();
        assert_eq!(group.table_count(), 0);
        assert_eq!(group.version, 0);
    }

    #[test]
    fn directory_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut group = Group::default();
        let k1 = group.add_table_entry("class_person", 64).unwrap();
        let k2 = group.add_table_entry("class_dog", 128).unwrap();
        assert_ne!(k1, k2);

        let top = group.flush(&mut tx, 1, (vec![], vec![], vec![])).unwrap();
        group.patch_logical_size(&mut tx, 4096).unwrap();

        let back = Group::attach(&tx, top).unwrap();
        assert_eq!(back.table_count(), 2);
        assert_eq!(back.find_table("class_person"), Some(k1));
        assert_eq!(back.table_top(k2).unwrap(), 128);
        assert_eq!(back.version, 1);
        assert_eq!(back.logical_size, 4096);
    }

    #[test]
    fn duplicate_table_name_is_rejected() {
        let mut group = Group::default();
        group.add_table_entry("class_a", 64).unwrap();
        assert!(group.add_table_entry("class_a", 128).is_err());
    }

    #[test]
    fn removed_table_keeps_keys_stable() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut group = Group::default();
        let k1 = group.add_table_entry("class_a", 64).unwrap();
        let k2 = group.add_table_entry("class_b", 128).unwrap();
        group.remove_table_entry(k1).unwrap();

        let top = group.flush(&mut tx, 1, (vec![], vec![], vec![])).unwrap();
        group.patch_logical_size(&mut tx, 4096).unwrap();

        let back = Group::attach(&tx, top).unwrap();
        assert_eq!(back.table_count(), 1);
        assert!(back.find_table("class_a").is_none());
        assert_eq!(back.find_table("class_b"), Some(k2));
        assert!(back.table_top(k1).is_err());
    }

    #[test]
    fn rename_table_entry_updates_lookup() {
        let mut group = Group::default();
        let k = group.add_table_entry("class_old", 64).unwrap();
        group.rename_table_entry(k, "class_new").unwrap();
        assert_eq!(group.find_table("class_new"), Some(k));
        assert!(group.find_table("class_old").is_none());
    }

    #[test]
    fn free_list_parts_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut group = Group::default();
        let top = group
            .flush(&mut tx, 3, (vec![100, 200], vec![8, 16], vec![1, 2]))
            .unwrap();
        group.patch_logical_size(&mut tx, 512).unwrap();
        let back = Group::attach(&tx, top).unwrap();
        assert_eq!(back.free_parts.0, vec![100, 200]);
        assert_eq!(back.free_parts.1, vec![8, 16]);
        assert_eq!(back.free_parts.2, vec![1, 2]);
    }
}
