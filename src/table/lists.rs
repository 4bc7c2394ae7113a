//! # List Columns
//!
//! A list column's cluster cell holds the root ref of a B+tree (0 while the
//! list has never been written). Scalar lists of the integer family use
//! fixed-size integer leaves; nullable scalars, strings, binaries and mixed
//! elements use byte leaves carrying the self-describing value encoding.
//! Link lists store raw object keys in integer leaves and route every edit
//! through backlink maintenance, so clearing a list of embedded or
//! strongly-linked targets removes the orphaned targets.

use eyre::Result;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::Array;
use crate::bptree::{self, BytesLeaf, IntLeaf};
use crate::cluster::{self, ColumnData, ColumnKind};
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::repl::TransactLog;
use crate::value::{ColKey, ObjKey, TableKey, Value};

use super::spec::{ColumnSpec, ColumnType};
use super::{
    backlink_remove, cascade_candidate, load_table, locate_cell, object_exists, remove_object,
    save_table, CascadeSet, TableInfo,
};

/// Whether this list stores fixed-size integer leaves.
fn uses_int_leaf(col: &ColumnSpec) -> bool {
    let fixed_scalar = matches!(
        col.ty,
        ColumnType::Int | ColumnType::Bool | ColumnType::Float | ColumnType::Double
    ) && !col.is_nullable();
    fixed_scalar || col.ty == ColumnType::Link
}

fn require_list(col: &ColumnSpec) -> Result<()> {
    if !col.is_list() {
        return Err(err(ErrorKind::LogicError(format!(
            "column '{}' is not a list",
            col.name
        ))));
    }
    Ok(())
}

fn int_element(col: &ColumnSpec, value: &Value) -> Result<i64> {
    Ok(match (col.ty, value) {
        (ColumnType::Int, Value::Int(v)) => *v,
        (ColumnType::Bool, Value::Bool(v)) => *v as i64,
        (ColumnType::Float, Value::Float(v)) => v.to_bits() as i64,
        (ColumnType::Double, Value::Double(v)) => v.to_bits() as i64,
        (ColumnType::Link, Value::Link(k)) => k.0,
        _ => {
            return Err(err(ErrorKind::LogicError(format!(
                "value of wrong type for list column '{}'",
                col.name
            ))))
        }
    })
}

fn int_element_to_value(col: &ColumnSpec, raw: i64) -> Value {
    match col.ty {
        ColumnType::Int => Value::Int(raw),
        ColumnType::Bool => Value::Bool(raw != 0),
        ColumnType::Float => Value::Float(f32::from_bits(raw as u32)),
        ColumnType::Double => Value::Double(f64::from_bits(raw as u64)),
        ColumnType::Link => Value::Link(ObjKey(raw)),
        _ => unreachable!("int leaves only cover the integer family and links"),
    }
}

fn bytes_element(col: &ColumnSpec, value: &Value) -> Result<Option<Vec<u8>>> {
    if value.is_null() {
        if col.ty != ColumnType::Mixed && !col.is_nullable() {
            return Err(err(ErrorKind::LogicError(format!(
                "null element in non-nullable list column '{}'",
                col.name
            ))));
        }
        return Ok(None);
    }
    let type_ok = match col.ty {
        ColumnType::Mixed => true,
        ColumnType::Int => matches!(value, Value::Int(_)),
        ColumnType::Bool => matches!(value, Value::Bool(_)),
        ColumnType::Float => matches!(value, Value::Float(_)),
        ColumnType::Double => matches!(value, Value::Double(_)),
        ColumnType::String => matches!(value, Value::String(_)),
        ColumnType::Binary => matches!(value, Value::Binary(_)),
        ColumnType::Timestamp => matches!(value, Value::Timestamp(_)),
        ColumnType::Decimal => matches!(value, Value::Decimal(_)),
        ColumnType::ObjectId => matches!(value, Value::ObjectId(_)),
        ColumnType::Uuid => matches!(value, Value::Uuid(_)),
        _ => false,
    };
    if !type_ok {
        return Err(err(ErrorKind::LogicError(format!(
            "value of wrong type for list column '{}'",
            col.name
        ))));
    }
    Ok(Some(value.encoded()))
}

fn bytes_element_to_value(raw: Option<Vec<u8>>) -> Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(bytes) => {
            let mut pos = 0;
            Value::decode(&bytes, &mut pos)
        }
    }
}

/// Current root of the list (0 = never written).
fn list_root<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
    col: ColKey,
) -> Result<Ref> {
    let (col_ref, idx) = locate_cell(alloc, info, key, col)?;
    Ok(Array::get_direct(alloc, col_ref, idx)? as Ref)
}

fn set_list_root(
    tx: &mut WriteAlloc,
    info: &mut TableInfo,
    key: ObjKey,
    col: ColKey,
    new_root: Ref,
) -> Result<()> {
    info.cluster = cluster::update_cell(
        tx,
        info.cluster,
        key.0,
        col.0 as usize,
        ColumnKind::Refs,
        |data, i| {
            match data {
                ColumnData::Refs(v) => v[i] = new_root as i64,
                _ => {
                    return Err(err(ErrorKind::InvalidDatabase(
                        "list column has wrong layout".into(),
                    )))
                }
            }
            Ok(())
        },
    )?;
    Ok(())
}

fn ensure_root(tx: &mut WriteAlloc, col: &ColumnSpec, root: Ref) -> Result<Ref> {
    if root != 0 {
        return Ok(root);
    }
    if uses_int_leaf(col) {
        bptree::create::<IntLeaf>(tx)
    } else {
        bptree::create::<BytesLeaf>(tx)
    }
}

pub fn list_size<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<usize> {
    let info = load_table(alloc, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    let root = list_root(alloc, &info, key, col)?;
    if root == 0 {
        return Ok(0);
    }
    if uses_int_leaf(&spec) {
        bptree::len::<IntLeaf, _>(alloc, root)
    } else {
        bptree::len::<BytesLeaf, _>(alloc, root)
    }
}

pub fn list_get<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    ndx: usize,
) -> Result<Value> {
    let info = load_table(alloc, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    let root = list_root(alloc, &info, key, col)?;
    if root == 0 {
        return Err(err(ErrorKind::LogicError(format!(
            "list index {} out of range (size 0)",
            ndx
        ))));
    }
    if uses_int_leaf(&spec) {
        Ok(int_element_to_value(
            &spec,
            bptree::get::<IntLeaf, _>(alloc, root, ndx)?,
        ))
    } else {
        bytes_element_to_value(bptree::get::<BytesLeaf, _>(alloc, root, ndx)?)
    }
}

/// Every element of the list as a dynamic value.
pub fn list_values<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<Vec<Value>> {
    let n = list_size(alloc, group, table, key, col)?;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(list_get(alloc, group, table, key, col, i)?);
    }
    Ok(out)
}

fn link_target_of(value: &Value) -> Option<ObjKey> {
    match value {
        Value::Link(k) => Some(*k),
        _ => None,
    }
}

fn check_link_target(
    tx: &mut WriteAlloc,
    group: &Group,
    spec: &ColumnSpec,
    value: &Value,
) -> Result<()> {
    if spec.ty != ColumnType::Link {
        return Ok(());
    }
    let target_table = spec.peer_table.expect("link column has target");
    match link_target_of(value) {
        Some(k) if k.is_unresolved() || object_exists(tx, group, target_table, k)? => Ok(()),
        Some(k) => Err(err(ErrorKind::LogicError(format!(
            "link target key {} does not exist",
            k.0
        )))),
        None => Err(err(ErrorKind::LogicError(format!(
            "value of wrong type for link list '{}'",
            spec.name
        )))),
    }
}

pub fn list_insert(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    ndx: usize,
    value: Value,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    check_link_target(tx, group, &spec, &value)?;

    let root = ensure_root(tx, &spec, list_root(tx, &info, key, col)?)?;
    let new_root = if uses_int_leaf(&spec) {
        bptree::insert::<IntLeaf>(tx, root, ndx, int_element(&spec, &value)?)?
    } else {
        bptree::insert::<BytesLeaf>(tx, root, ndx, bytes_element(&spec, &value)?)?
    };
    set_list_root(tx, &mut info, key, col, new_root)?;
    save_table(tx, group, &mut info, false)?;

    if spec.ty == ColumnType::Link {
        let target = link_target_of(&value).expect("validated above");
        if !target.is_unresolved() {
            let target_table = spec.peer_table.expect("link column has target");
            let target_info = load_table(tx, group, target_table)?;
            let bl_col = target_info.spec.backlink_col_for(table, col).ok_or_else(|| {
                err(ErrorKind::InvalidDatabase(
                    "link column without backlink mirror".into(),
                ))
            })?;
            super::backlink_add(tx, group, target_table, target, bl_col, key)?;
        }
    }

    if let Some(log) = repl.as_mut() {
        log.list_insert(table, col, key, ndx, &value);
    }
    Ok(())
}

pub fn list_set(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    ndx: usize,
    value: Value,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    check_link_target(tx, group, &spec, &value)?;

    let root = list_root(tx, &info, key, col)?;
    if root == 0 {
        return Err(err(ErrorKind::LogicError(format!(
            "list index {} out of range (size 0)",
            ndx
        ))));
    }

    let mut cascade: CascadeSet = Default::default();
    if spec.ty == ColumnType::Link {
        let old = ObjKey(bptree::get::<IntLeaf, _>(tx, root, ndx)?);
        let new = link_target_of(&value).expect("validated above");
        if old != new {
            let target_table = spec.peer_table.expect("link column has target");
            let target_info = load_table(tx, group, target_table)?;
            let embedded = target_info.is_embedded();
            let bl_col = target_info.spec.backlink_col_for(table, col).ok_or_else(|| {
                err(ErrorKind::InvalidDatabase(
                    "link column without backlink mirror".into(),
                ))
            })?;
            if !old.is_unresolved() && object_exists(tx, group, target_table, old)? {
                let remaining = backlink_remove(tx, group, target_table, old, bl_col, key)?;
                if cascade_candidate(remaining, spec.is_strong(), embedded) {
                    cascade.push((target_table, old));
                }
            }
            if !new.is_unresolved() {
                super::backlink_add(tx, group, target_table, new, bl_col, key)?;
            }
        }
    }

    let mut info = load_table(tx, group, table)?;
    let root = list_root(tx, &info, key, col)?;
    let new_root = if uses_int_leaf(&spec) {
        bptree::set::<IntLeaf>(tx, root, ndx, int_element(&spec, &value)?)?
    } else {
        bptree::set::<BytesLeaf>(tx, root, ndx, bytes_element(&spec, &value)?)?
    };
    set_list_root(tx, &mut info, key, col, new_root)?;
    save_table(tx, group, &mut info, false)?;

    if let Some(log) = repl.as_mut() {
        log.list_set(table, col, key, ndx, &value);
    }
    for (t, k) in cascade {
        if object_exists(tx, group, t, k)? {
            remove_object(tx, group, repl, t, k)?;
        }
    }
    Ok(())
}

pub fn list_remove(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    ndx: usize,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    let root = list_root(tx, &info, key, col)?;
    if root == 0 {
        return Err(err(ErrorKind::LogicError(format!(
            "list index {} out of range (size 0)",
            ndx
        ))));
    }

    let mut cascade: CascadeSet = Default::default();
    if spec.ty == ColumnType::Link {
        let old = ObjKey(bptree::get::<IntLeaf, _>(tx, root, ndx)?);
        if !old.is_unresolved() {
            let target_table = spec.peer_table.expect("link column has target");
            if object_exists(tx, group, target_table, old)? {
                let target_info = load_table(tx, group, target_table)?;
                let embedded = target_info.is_embedded();
                let bl_col =
                    target_info.spec.backlink_col_for(table, col).ok_or_else(|| {
                        err(ErrorKind::InvalidDatabase(
                            "link column without backlink mirror".into(),
                        ))
                    })?;
                let remaining = backlink_remove(tx, group, target_table, old, bl_col, key)?;
                if cascade_candidate(remaining, spec.is_strong(), embedded) {
                    cascade.push((target_table, old));
                }
            }
        }
    }

    let mut info = load_table(tx, group, table)?;
    let root = list_root(tx, &info, key, col)?;
    let new_root = if uses_int_leaf(&spec) {
        bptree::erase::<IntLeaf>(tx, root, ndx)?
    } else {
        bptree::erase::<BytesLeaf>(tx, root, ndx)?
    };
    set_list_root(tx, &mut info, key, col, new_root)?;
    save_table(tx, group, &mut info, false)?;

    if let Some(log) = repl.as_mut() {
        log.list_erase(table, col, key, ndx);
    }
    for (t, k) in cascade {
        if object_exists(tx, group, t, k)? {
            remove_object(tx, group, repl, t, k)?;
        }
    }
    Ok(())
}

pub fn list_clear(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    require_list(&spec)?;
    let root = list_root(tx, &info, key, col)?;
    let old_size = if root == 0 {
        0
    } else if uses_int_leaf(&spec) {
        bptree::len::<IntLeaf, _>(tx, root)?
    } else {
        bptree::len::<BytesLeaf, _>(tx, root)?
    };

    let mut cascade: CascadeSet = Default::default();
    if spec.ty == ColumnType::Link && root != 0 {
        let targets = link_list_targets(tx, &info, key, col)?;
        let target_table = spec.peer_table.expect("link column has target");
        let target_info = load_table(tx, group, target_table)?;
        let embedded = target_info.is_embedded();
        let bl_col = target_info.spec.backlink_col_for(table, col).ok_or_else(|| {
            err(ErrorKind::InvalidDatabase(
                "link column without backlink mirror".into(),
            ))
        })?;
        for target in targets {
            if target.is_unresolved() || !object_exists(tx, group, target_table, target)? {
                continue;
            }
            let remaining = backlink_remove(tx, group, target_table, target, bl_col, key)?;
            if cascade_candidate(remaining, spec.is_strong(), embedded) {
                cascade.push((target_table, target));
            }
        }
    }

    let mut info = load_table(tx, group, table)?;
    let root = list_root(tx, &info, key, col)?;
    if root != 0 {
        let new_root = if uses_int_leaf(&spec) {
            bptree::clear::<IntLeaf>(tx, root)?
        } else {
            bptree::clear::<BytesLeaf>(tx, root)?
        };
        set_list_root(tx, &mut info, key, col, new_root)?;
        save_table(tx, group, &mut info, false)?;
    }

    if let Some(log) = repl.as_mut() {
        log.list_clear(table, col, key, old_size);
    }
    for (t, k) in cascade {
        if object_exists(tx, group, t, k)? {
            remove_object(tx, group, repl, t, k)?;
        }
    }
    Ok(())
}

/// Targets currently referenced by a link list (internal, removal path).
pub(crate) fn link_list_targets<A: Allocator + ?Sized>(
    alloc: &A,
    info: &TableInfo,
    key: ObjKey,
    col: ColKey,
) -> Result<Vec<ObjKey>> {
    let root = list_root(alloc, info, key, col)?;
    if root == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    bptree::for_each::<IntLeaf, _>(alloc, root, &mut |_, raw| {
        out.push(ObjKey(raw));
        Ok(())
    })?;
    Ok(out)
}

/// Strips every occurrence of `target` from a link list without touching
/// backlinks (the target row is being removed). No instruction is emitted:
/// the removal is a derived effect.
pub(crate) fn link_list_remove_all(
    tx: &mut WriteAlloc,
    info: &mut TableInfo,
    key: ObjKey,
    col: ColKey,
    target: ObjKey,
) -> Result<()> {
    let root = list_root(tx, info, key, col)?;
    if root == 0 {
        return Ok(());
    }
    let mut positions = Vec::new();
    bptree::for_each::<IntLeaf, _>(tx, root, &mut |i, raw| {
        if raw == target.0 {
            positions.push(i);
        }
        Ok(())
    })?;
    let mut root = root;
    for &pos in positions.iter().rev() {
        root = bptree::erase::<IntLeaf>(tx, root, pos)?;
    }
    set_list_root(tx, info, key, col, root)
}

/// Sorts `indices` (list positions) by element value.
pub fn list_sort<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    indices: &mut Vec<usize>,
    ascending: bool,
) -> Result<()> {
    let values = list_values(alloc, group, table, key, col)?;
    indices.retain(|&i| i < values.len());
    indices.sort_by(|&a, &b| {
        let ord = values[a].total_cmp(&values[b]);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    Ok(())
}

/// Reduces `indices` to the first occurrence of each distinct value,
/// optionally sorting the result.
pub fn list_distinct<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    indices: &mut Vec<usize>,
    sort_ascending: Option<bool>,
) -> Result<()> {
    let values = list_values(alloc, group, table, key, col)?;
    indices.retain(|&i| i < values.len());
    let mut seen: Vec<&Value> = Vec::new();
    indices.retain(|&i| {
        if seen.iter().any(|v| (*v).total_cmp(&values[i]) == std::cmp::Ordering::Equal) {
            false
        } else {
            seen.push(&values[i]);
            true
        }
    });
    if let Some(asc) = sort_ascending {
        indices.sort_by(|&a, &b| {
            let ord = values[a].total_cmp(&values[b]);
            if asc {
                ord
            } else {
                ord.reverse()
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FileMap, SlabAlloc, FILE_HEADER_SIZE};
    use crate::table::spec::{ATTR_LIST, ATTR_STRONG_LINKS};
    use crate::table::{add_column, create_object, create_table, table_size};

    fn setup() -> (std::sync::Arc<SlabAlloc>, WriteAlloc, Group, Option<TransactLog>) {
        let slab = std::sync::Arc::new(SlabAlloc::new(FileMap::new_mem().unwrap()));
        let tx = WriteAlloc::new(slab.clone(), FILE_HEADER_SIZE as u64, Vec::new());
        (slab, tx, Group::default(), Some(TransactLog::new()))
    }

    fn list_col(name: &str, ty: ColumnType, extra: u8) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            ty,
            attrs: ATTR_LIST | extra,
            peer_table: None,
            origin_col: None,
        }
    }

    #[test]
    fn int_list_insert_get_set_remove() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let c = add_column(&mut tx, &mut group, &mut repl, t, list_col("ints", ColumnType::Int, 0))
            .unwrap();
        let k = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();

        assert_eq!(list_size(&tx, &group, t, k, c).unwrap(), 0);
        list_insert(&mut tx, &mut group, &mut repl, t, k, c, 0, Value::Int(1)).unwrap();
        list_insert(&mut tx, &mut group, &mut repl, t, k, c, 1, Value::Int(3)).unwrap();
        list_insert(&mut tx, &mut group, &mut repl, t, k, c, 1, Value::Int(2)).unwrap();
        assert_eq!(list_size(&tx, &group, t, k, c).unwrap(), 3);
        assert_eq!(list_get(&tx, &group, t, k, c, 1).unwrap(), Value::Int(2));

        list_set(&mut tx, &mut group, &mut repl, t, k, c, 1, Value::Int(20)).unwrap();
        assert_eq!(list_get(&tx, &group, t, k, c, 1).unwrap(), Value::Int(20));

        list_remove(&mut tx, &mut group, &mut repl, t, k, c, 0).unwrap();
        assert_eq!(list_size(&tx, &group, t, k, c).unwrap(), 2);
        assert_eq!(list_get(&tx, &group, t, k, c, 0).unwrap(), Value::Int(20));
    }

    #[test]
    fn string_list_holds_nulls_when_nullable() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let c = add_column(
            &mut tx,
            &mut group,
            &mut repl,
            t,
            list_col("strs", ColumnType::String, crate::table::spec::ATTR_NULLABLE),
        )
        .unwrap();
        let k = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();

        list_insert(&mut tx, &mut group, &mut repl, t, k, c, 0, Value::String("a".into())).unwrap();
        list_insert(&mut tx, &mut group, &mut repl, t, k, c, 1, Value::Null).unwrap();
        assert_eq!(
            list_get(&tx, &group, t, k, c, 0).unwrap(),
            Value::String("a".into())
        );
        assert_eq!(list_get(&tx, &group, t, k, c, 1).unwrap(), Value::Null);
    }

    #[test]
    fn clear_empties_list() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let c = add_column(&mut tx, &mut group, &mut repl, t, list_col("ints", ColumnType::Int, 0))
            .unwrap();
        let k = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        for i in 0..5 {
            list_insert(&mut tx, &mut group, &mut repl, t, k, c, i, Value::Int(i as i64)).unwrap();
        }
        list_clear(&mut tx, &mut group, &mut repl, t, k, c).unwrap();
        assert_eq!(list_size(&tx, &group, t, k, c).unwrap(), 0);
    }

    #[test]
    fn link_list_maintains_backlinks() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let a = create_table(&mut tx, &mut group, &mut repl, "class_a", false).unwrap();
        let b = create_table(&mut tx, &mut group, &mut repl, "class_b", false).unwrap();
        let c = add_column(
            &mut tx,
            &mut group,
            &mut repl,
            a,
            ColumnSpec {
                name: "links".into(),
                ty: ColumnType::Link,
                attrs: ATTR_LIST,
                peer_table: Some(b),
                origin_col: None,
            },
        )
        .unwrap();
        let origin = create_object(&mut tx, &mut group, &mut repl, a, None).unwrap();
        let t1 = create_object(&mut tx, &mut group, &mut repl, b, None).unwrap();
        let t2 = create_object(&mut tx, &mut group, &mut repl, b, None).unwrap();

        list_insert(&mut tx, &mut group, &mut repl, a, origin, c, 0, Value::Link(t1)).unwrap();
        list_insert(&mut tx, &mut group, &mut repl, a, origin, c, 1, Value::Link(t2)).unwrap();
        list_insert(&mut tx, &mut group, &mut repl, a, origin, c, 2, Value::Link(t1)).unwrap();

        let b_info = load_table(&tx, &group, b).unwrap();
        let bl = b_info.spec.backlink_col_for(a, c).unwrap();
        assert_eq!(super::super::backlink_count(&tx, &b_info, t1, bl).unwrap(), 2);
        assert_eq!(super::super::backlink_count(&tx, &b_info, t2, bl).unwrap(), 1);

        list_remove(&mut tx, &mut group, &mut repl, a, origin, c, 0).unwrap();
        let b_info = load_table(&tx, &group, b).unwrap();
        assert_eq!(super::super::backlink_count(&tx, &b_info, t1, bl).unwrap(), 1);
    }

    #[test]
    fn clearing_strong_link_list_removes_targets() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let a = create_table(&mut tx, &mut group, &mut repl, "class_a", false).unwrap();
        let b = create_table(&mut tx, &mut group, &mut repl, "class_b", false).unwrap();
        let c = add_column(
            &mut tx,
            &mut group,
            &mut repl,
            a,
            ColumnSpec {
                name: "owned".into(),
                ty: ColumnType::Link,
                attrs: ATTR_LIST | ATTR_STRONG_LINKS,
                peer_table: Some(b),
                origin_col: None,
            },
        )
        .unwrap();
        let origin = create_object(&mut tx, &mut group, &mut repl, a, None).unwrap();
        for _ in 0..3 {
            let target = create_object(&mut tx, &mut group, &mut repl, b, None).unwrap();
            let n = list_size(&tx, &group, a, origin, c).unwrap();
            list_insert(&mut tx, &mut group, &mut repl, a, origin, c, n, Value::Link(target))
                .unwrap();
        }
        assert_eq!(table_size(&tx, &group, b).unwrap(), 3);
        list_clear(&mut tx, &mut group, &mut repl, a, origin, c).unwrap();
        assert_eq!(table_size(&tx, &group, b).unwrap(), 0);
    }

    #[test]
    fn sort_and_distinct_produce_index_orders() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let c = add_column(&mut tx, &mut group, &mut repl, t, list_col("ints", ColumnType::Int, 0))
            .unwrap();
        let k = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        for (i, v) in [30i64, 10, 20, 10].iter().enumerate() {
            list_insert(&mut tx, &mut group, &mut repl, t, k, c, i, Value::Int(*v)).unwrap();
        }

        let mut indices: Vec<usize> = (0..4).collect();
        list_sort(&tx, &group, t, k, c, &mut indices, true).unwrap();
        assert_eq!(indices, vec![1, 3, 2, 0]);

        let mut indices: Vec<usize> = (0..4).collect();
        list_distinct(&tx, &group, t, k, c, &mut indices, None).unwrap();
        assert_eq!(indices, vec![0, 1, 2]);

        let mut indices: Vec<usize> = (0..4).collect();
        list_distinct(&tx, &group, t, k, c, &mut indices, Some(true)).unwrap();
        assert_eq!(indices, vec![1, 2, 0]);
    }

    #[test]
    fn out_of_range_list_access_fails() {
        let (_s, mut tx, mut group, mut repl) = setup();
        let t = create_table(&mut tx, &mut group, &mut repl, "class_t", false).unwrap();
        let c = add_column(&mut tx, &mut group, &mut repl, t, list_col("ints", ColumnType::Int, 0))
            .unwrap();
        let k = create_object(&mut tx, &mut group, &mut repl, t, None).unwrap();
        assert!(list_get(&tx, &group, t, k, c, 0).is_err());
        assert!(list_set(&mut tx, &mut group, &mut repl, t, k, c, 0, Value::Int(1)).is_err());
        assert!(list_remove(&mut tx, &mut group, &mut repl, t, k, c, 0).is_err());
    }
}
