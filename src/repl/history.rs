//! # Changeset History
//!
//! Per-version changeset storage under the group root. The history slot
//! points at a two-slot array: the tagged base version and a B+tree of
//! changeset blobs, where the blob for version `v` lives at index
//! `v - base - 1`. Every commit appends exactly one (possibly empty)
//! changeset, so the indexing stays dense; a sync client consumes the tail
//! through [`changesets_since`].

use eyre::Result;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::{is_tagged, tag_int, untag_int, Array};
use crate::bptree::{self, BytesLeaf};
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::node::FLAG_HAS_REFS;

fn load_history<A: Allocator + ?Sized>(alloc: &A, history: Ref) -> Result<(u64, Ref)> {
    let top = Array::load(alloc, history)?;
    if top.len() != 2 || !is_tagged(top.get(0)) {
        return Err(err(ErrorKind::InvalidDatabase(
            "history top is malformed".into(),
        )));
    }
    Ok((untag_int(top.get(0)) as u64, top.get(1) as Ref))
}

/// Appends the changeset for `version` (the version about to be
/// published).
pub fn append_changeset(
    tx: &mut WriteAlloc,
    group: &mut Group,
    version: u64,
    bytes: &[u8],
) -> Result<()> {
    let (base, tree) = if group.history == 0 {
        (version - 1, bptree::create::<BytesLeaf>(tx)?)
    } else {
        let (base, tree) = load_history(tx, group.history)?;
        tx.free_node(group.history)?;
        (base, tree)
    };

    let expected = bptree::len::<BytesLeaf, _>(tx, tree)?;
    if version != base + expected as u64 + 1 {
        return Err(err(ErrorKind::InvalidDatabase(format!(
            "history out of sequence: version {} after {} changesets from base {}",
            version, expected, base
        ))));
    }

    let tree = bptree::push::<BytesLeaf>(tx, tree, Some(bytes.to_vec()))?;
    group.history = Array::from_values(
        FLAG_HAS_REFS,
        vec![tag_int(base as i64), tree as i64],
    )
    .store(tx)?;
    Ok(())
}

/// The changeset recorded for one version, if history reaches back that
/// far.
pub fn changeset_for_version<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    version: u64,
) -> Result<Option<Vec<u8>>> {
    if group.history == 0 {
        return Ok(None);
    }
    let (base, tree) = load_history(alloc, group.history)?;
    if version <= base {
        return Ok(None);
    }
    let idx = (version - base - 1) as usize;
    if idx >= bptree::len::<BytesLeaf, _>(alloc, tree)? {
        return Ok(None);
    }
    Ok(bptree::get::<BytesLeaf, _>(alloc, tree, idx)?)
}

/// All changesets for versions strictly after `from_version`, in commit
/// order.
pub fn changesets_since<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    from_version: u64,
) -> Result<Vec<(u64, Vec<u8>)>> {
    if group.history == 0 {
        return Ok(Vec::new());
    }
    let (base, tree) = load_history(alloc, group.history)?;
    let count = bptree::len::<BytesLeaf, _>(alloc, tree)?;
    let mut out = Vec::new();
    for idx in 0..count {
        let version = base + idx as u64 + 1;
        if version <= from_version {
            continue;
        }
        let bytes = bptree::get::<BytesLeaf, _>(alloc, tree, idx)?.unwrap_or_default();
        out.push((version, bytes));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FileMap, SlabAlloc, FILE_HEADER_SIZE};

    fn setup() -> (std::sync::Arc<SlabAlloc>, WriteAlloc, Group) {
        let slab = std::sync::Arc::new(SlabAlloc::new(FileMap::new_mem().unwrap()));
        let tx = WriteAlloc::new(slab.clone(), FILE_HEADER_SIZE as u64, Vec::new());
        (slab, tx, Group::default())
    }

    #[test]
    fn appended_changesets_read_back_in_order() {
        let (_s, mut tx, mut group) = setup();
        append_changeset(&mut tx, &mut group, 1, b"first").unwrap();
        append_changeset(&mut tx, &mut group, 2, b"second").unwrap();
        append_changeset(&mut tx, &mut group, 3, b"").unwrap();

        assert_eq!(
            changeset_for_version(&tx, &group, 1).unwrap(),
            Some(b"first".to_vec())
        );
        assert_eq!(
            changeset_for_version(&tx, &group, 2).unwrap(),
            Some(b"second".to_vec())
        );
        assert_eq!(
            changeset_for_version(&tx, &group, 3).unwrap(),
            Some(Vec::new())
        );
        assert_eq!(changeset_for_version(&tx, &group, 4).unwrap(), None);
    }

    #[test]
    fn out_of_sequence_append_is_rejected() {
        let (_s, mut tx, mut group) = setup();
        append_changeset(&mut tx, &mut group, 1, b"a").unwrap();
        assert!(append_changeset(&mut tx, &mut group, 3, b"skip").is_err());
    }

    #[test]
    fn changesets_since_skips_consumed_prefix() {
        let (_s, mut tx, mut group) = setup();
        for v in 1..=4u64 {
            append_changeset(&mut tx, &mut group, v, format!("cs{}", v).as_bytes()).unwrap();
        }
        let tail = changesets_since(&tx, &group, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], (3, b"cs3".to_vec()));
        assert_eq!(tail[1], (4, b"cs4".to_vec()));
    }

    #[test]
    fn history_starting_late_has_matching_base() {
        let (_s, mut tx, mut group) = setup();
        group.version = 9;
        append_changeset(&mut tx, &mut group, 10, b"late").unwrap();
        assert_eq!(changeset_for_version(&tx, &group, 9).unwrap(), None);
        assert_eq!(
            changeset_for_version(&tx, &group, 10).unwrap(),
            Some(b"late".to_vec())
        );
    }
}
