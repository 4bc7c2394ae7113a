//! # Field Access
//!
//! Typed reads and writes on single-value columns, including the link write
//! protocol. Values cross the storage boundary through two physical
//! representations: the integer family stores bit patterns in nullable int
//! arrays, everything else serializes into the blob columns (timestamps as
//! 12-byte seconds+nanos, the fixed-width types as their raw bytes, mixed
//! as the self-describing value encoding).
//!
//! ## Link Writes
//!
//! Setting a link column with a changed target removes one backlink entry
//! from the old target, adds one to the new target, and — when the column
//! has strong-link semantics or the target is embedded and the old target
//! just lost its final backlink — schedules the old target for cascade
//! removal. The `Set` instruction is recorded before the cascade drains, so
//! changeset order mirrors program order.

use eyre::Result;

use crate::alloc::{Allocator, WriteAlloc};
use crate::array::{Array, ArrayIntNull};
use crate::array::blobs::{ArrayBlobs, MAX_BLOB_SIZE};
use crate::cluster::{self, ColumnData, ColumnKind};
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::repl::TransactLog;
use crate::value::{ColKey, Decimal128, ObjKey, ObjectId, TableKey, Timestamp, Uuid, Value};

use super::spec::{ColumnSpec, ColumnType};
use super::{
    backlink_remove, cascade_candidate, load_table, locate_cell, object_exists, remove_object,
    save_table,
};

pub(crate) fn encode_int_repr(col: &ColumnSpec, value: &Value) -> Result<Option<i64>> {
    match (col.ty, value) {
        (_, Value::Null) => {
            if !col.is_nullable() {
                return Err(err(ErrorKind::LogicError(format!(
                    "null written to non-nullable column '{}'",
                    col.name
                ))));
            }
            Ok(None)
        }
        (ColumnType::Int, Value::Int(v)) => Ok(Some(*v)),
        (ColumnType::Bool, Value::Bool(v)) => Ok(Some(*v as i64)),
        (ColumnType::Float, Value::Float(v)) => Ok(Some(v.to_bits() as i64)),
        (ColumnType::Double, Value::Double(v)) => Ok(Some(v.to_bits() as i64)),
        _ => Err(err(ErrorKind::LogicError(format!(
            "value of wrong type for column '{}'",
            col.name
        )))),
    }
}

pub(crate) fn decode_int_repr(ty: ColumnType, nullable: bool, raw: Option<i64>) -> Value {
    match raw {
        None if nullable => Value::Null,
        raw => {
            let v = raw.unwrap_or(0);
            match ty {
                ColumnType::Int => Value::Int(v),
                ColumnType::Bool => Value::Bool(v != 0),
                ColumnType::Float => Value::Float(f32::from_bits(v as u32)),
                ColumnType::Double => Value::Double(f64::from_bits(v as u64)),
                _ => unreachable!("int repr only covers the integer family"),
            }
        }
    }
}

pub(crate) fn encode_blob_repr(col: &ColumnSpec, value: &Value) -> Result<Option<Vec<u8>>> {
    if value.is_null() {
        if col.ty != ColumnType::Mixed && !col.is_nullable() {
            return Err(err(ErrorKind::LogicError(format!(
                "null written to non-nullable column '{}'",
                col.name
            ))));
        }
        return Ok(None);
    }
    let bytes = match (col.ty, value) {
        (ColumnType::String, Value::String(s)) => s.as_bytes().to_vec(),
        (ColumnType::Binary, Value::Binary(b)) => b.clone(),
        (ColumnType::Timestamp, Value::Timestamp(t)) => {
            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&t.seconds.to_le_bytes());
            out.extend_from_slice(&t.nanoseconds.to_le_bytes());
            out
        }
        (ColumnType::Decimal, Value::Decimal(d)) => d.0.to_vec(),
        (ColumnType::ObjectId, Value::ObjectId(o)) => o.0.to_vec(),
        (ColumnType::Uuid, Value::Uuid(u)) => u.0.to_vec(),
        (ColumnType::Mixed, v) => v.encoded(),
        _ => {
            return Err(err(ErrorKind::LogicError(format!(
                "value of wrong type for column '{}'",
                col.name
            ))))
        }
    };
    if matches!(col.ty, ColumnType::String | ColumnType::Binary) && bytes.len() > MAX_BLOB_SIZE {
        return Err(err(ErrorKind::LogicError(format!(
            "value of {} bytes exceeds the element size limit",
            bytes.len()
        ))));
    }
    Ok(Some(bytes))
}

pub(crate) fn decode_blob_repr(
    ty: ColumnType,
    nullable: bool,
    raw: Option<&[u8]>,
) -> Result<Value> {
    let bytes = match raw {
        None if nullable || ty == ColumnType::Mixed => return Ok(Value::Null),
        None => &[][..],
        Some(b) => b,
    };
    Ok(match ty {
        ColumnType::String => Value::String(
            std::str::from_utf8(bytes)
                .map_err(|_| err(ErrorKind::InvalidDatabase("non-UTF-8 string cell".into())))?
                .to_owned(),
        ),
        ColumnType::Binary => Value::Binary(bytes.to_vec()),
        ColumnType::Timestamp => {
            if bytes.is_empty() {
                Value::Timestamp(Timestamp {
                    seconds: 0,
                    nanoseconds: 0,
                })
            } else if bytes.len() == 12 {
                Value::Timestamp(Timestamp {
                    seconds: i64::from_le_bytes(bytes[..8].try_into().unwrap()),
                    nanoseconds: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
                })
            } else {
                return Err(err(ErrorKind::InvalidDatabase(
                    "timestamp cell has wrong length".into(),
                )));
            }
        }
        ColumnType::Decimal => {
            if bytes.is_empty() {
                Value::Decimal(Decimal128([0; 16]))
            } else {
                Value::Decimal(Decimal128(bytes.try_into().map_err(|_| {
                    err(ErrorKind::InvalidDatabase("decimal cell has wrong length".into()))
                })?))
            }
        }
        ColumnType::ObjectId => {
            if bytes.is_empty() {
                Value::ObjectId(ObjectId([0; 12]))
            } else {
                Value::ObjectId(ObjectId(bytes.try_into().map_err(|_| {
                    err(ErrorKind::InvalidDatabase("objectid cell has wrong length".into()))
                })?))
            }
        }
        ColumnType::Uuid => {
            if bytes.is_empty() {
                Value::Uuid(Uuid([0; 16]))
            } else {
                Value::Uuid(Uuid(bytes.try_into().map_err(|_| {
                    err(ErrorKind::InvalidDatabase("uuid cell has wrong length".into()))
                })?))
            }
        }
        ColumnType::Mixed => {
            if bytes.is_empty() {
                Value::Null
            } else {
                let mut pos = 0;
                Value::decode(bytes, &mut pos)?
            }
        }
        _ => unreachable!("blob repr only covers the blob family"),
    })
}

/// Reads one field as a dynamic value.
pub fn obj_get<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<Value> {
    let info = load_table(alloc, group, table)?;
    let spec = info.spec.col(col)?.clone();
    if spec.is_list() {
        return Err(err(ErrorKind::LogicError(format!(
            "column '{}' is a list",
            spec.name
        ))));
    }
    let (col_ref, idx) = locate_cell(alloc, &info, key, col)?;
    match spec.kind() {
        ColumnKind::Ints => {
            let raw = ArrayIntNull::get_direct(alloc, col_ref, idx)?;
            Ok(decode_int_repr(spec.ty, spec.is_nullable(), raw))
        }
        ColumnKind::Blobs => {
            let raw = ArrayBlobs::get_direct(alloc, col_ref, idx)?;
            decode_blob_repr(spec.ty, spec.is_nullable(), raw)
        }
        ColumnKind::Keys => match Array::get_direct(alloc, col_ref, idx)? {
            0 => Ok(Value::Null),
            raw => Ok(Value::Link(ObjKey(raw - 1))),
        },
        ColumnKind::Backlinks | ColumnKind::Refs => Err(err(ErrorKind::LogicError(format!(
            "column '{}' has no single value",
            spec.name
        )))),
    }
}

pub fn obj_is_null<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<bool> {
    Ok(obj_get(alloc, group, table, key, col)?.is_null())
}

/// Writes one field. `is_default` marks the write as a default-population
/// write in the changeset (merge rules treat those as weaker).
pub fn obj_set(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    value: Value,
    is_default: bool,
) -> Result<()> {
    let info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    if spec.is_list() {
        return Err(err(ErrorKind::LogicError(format!(
            "column '{}' is a list",
            spec.name
        ))));
    }

    if spec.ty == ColumnType::Link {
        return set_link(tx, group, repl, table, key, col, &spec, value);
    }

    match spec.kind() {
        ColumnKind::Ints => {
            let raw = encode_int_repr(&spec, &value)?;
            let mut info = info;
            info.cluster = cluster::update_cell(
                tx,
                info.cluster,
                key.0,
                col.0 as usize,
                ColumnKind::Ints,
                |data, i| {
                    match data {
                        ColumnData::Ints(v) => v[i] = raw,
                        _ => {
                            return Err(err(ErrorKind::InvalidDatabase(
                                "scalar column has wrong layout".into(),
                            )))
                        }
                    }
                    Ok(())
                },
            )?;
            save_table(tx, group, &mut info, false)?;
        }
        ColumnKind::Blobs => {
            let raw = encode_blob_repr(&spec, &value)?;
            let mut info = info;
            info.cluster = cluster::update_cell(
                tx,
                info.cluster,
                key.0,
                col.0 as usize,
                ColumnKind::Blobs,
                |data, i| {
                    match data {
                        ColumnData::Blobs(v) => v[i] = raw,
                        _ => {
                            return Err(err(ErrorKind::InvalidDatabase(
                                "blob column has wrong layout".into(),
                            )))
                        }
                    }
                    Ok(())
                },
            )?;
            save_table(tx, group, &mut info, false)?;
        }
        _ => {
            return Err(err(ErrorKind::LogicError(format!(
                "column '{}' cannot be written as a single value",
                spec.name
            ))))
        }
    }

    if let Some(log) = repl.as_mut() {
        if is_default {
            log.set_default(table, col, key, &value);
        } else {
            log.set(table, col, key, &value);
        }
    }
    Ok(())
}

fn set_link(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    spec: &ColumnSpec,
    value: Value,
) -> Result<()> {
    let new_key = match &value {
        Value::Null => None,
        Value::Link(k) => Some(*k),
        _ => {
            return Err(err(ErrorKind::LogicError(format!(
                "value of wrong type for link column '{}'",
                spec.name
            ))))
        }
    };
    let target_table = spec.peer_table.expect("link column has target");
    if let Some(nk) = new_key {
        if !nk.is_unresolved() && !object_exists(tx, group, target_table, nk)? {
            return Err(err(ErrorKind::LogicError(format!(
                "link target key {} does not exist",
                nk.0
            ))));
        }
    }

    let info = load_table(tx, group, table)?;
    let (col_ref, idx) = locate_cell(tx, &info, key, col)?;
    let old_key = match Array::get_direct(tx, col_ref, idx)? {
        0 => None,
        raw => Some(ObjKey(raw - 1)),
    };

    let mut cascade: super::CascadeSet = Default::default();
    if old_key != new_key {
        let target_info = load_table(tx, group, target_table)?;
        let embedded = target_info.is_embedded();
        let bl_col = target_info.spec.backlink_col_for(table, col).ok_or_else(|| {
            err(ErrorKind::InvalidDatabase(
                "link column without backlink mirror".into(),
            ))
        })?;

        if let Some(ok) = old_key {
            if !ok.is_unresolved() && object_exists(tx, group, target_table, ok)? {
                let remaining = backlink_remove(tx, group, target_table, ok, bl_col, key)?;
                if cascade_candidate(remaining, spec.is_strong(), embedded) {
                    cascade.push((target_table, ok));
                }
            }
        }
        if let Some(nk) = new_key {
            if !nk.is_unresolved() {
                super::backlink_add(tx, group, target_table, nk, bl_col, key)?;
            }
        }

        let mut info = load_table(tx, group, table)?;
        let raw = new_key.map(|k| k.0 + 1).unwrap_or(0);
        info.cluster = cluster::update_cell(
            tx,
            info.cluster,
            key.0,
            col.0 as usize,
            ColumnKind::Keys,
            |data, i| {
                match data {
                    ColumnData::Keys(v) => v[i] = raw,
                    _ => {
                        return Err(err(ErrorKind::InvalidDatabase(
                            "link column has wrong layout".into(),
                        )))
                    }
                }
                Ok(())
            },
        )?;
        save_table(tx, group, &mut info, false)?;
    }

    if let Some(log) = repl.as_mut() {
        log.set(table, col, key, &value);
    }

    for (t, k) in cascade {
        if object_exists(tx, group, t, k)? {
            remove_object(tx, group, repl, t, k)?;
        }
    }
    Ok(())
}

/// Atomic-increment semantics for integer columns.
pub fn obj_add_int(
    tx: &mut WriteAlloc,
    group: &mut Group,
    repl: &mut Option<TransactLog>,
    table: TableKey,
    key: ObjKey,
    col: ColKey,
    delta: i64,
) -> Result<()> {
    let info = load_table(tx, group, table)?;
    let spec = info.spec.col(col)?.clone();
    if spec.ty != ColumnType::Int || spec.is_list() {
        return Err(err(ErrorKind::LogicError(format!(
            "add_int requires an integer column, got '{}'",
            spec.name
        ))));
    }
    let mut info = info;
    info.cluster = cluster::update_cell(
        tx,
        info.cluster,
        key.0,
        col.0 as usize,
        ColumnKind::Ints,
        |data, i| {
            match data {
                ColumnData::Ints(v) => match v[i] {
                    Some(old) => v[i] = Some(old.wrapping_add(delta)),
                    None => {
                        return Err(err(ErrorKind::LogicError(
                            "add_int on a null value".into(),
                        )))
                    }
                },
                _ => {
                    return Err(err(ErrorKind::InvalidDatabase(
                        "scalar column has wrong layout".into(),
                    )))
                }
            }
            Ok(())
        },
    )?;
    save_table(tx, group, &mut info, false)?;
    if let Some(log) = repl.as_mut() {
        log.add_int(table, col, key, delta);
    }
    Ok(())
}

/// Linear scan lookup; the transaction layer fronts this with the search
/// index when one is built.
pub fn find_first_scan<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    col: ColKey,
    value: &Value,
) -> Result<Option<ObjKey>> {
    let info = load_table(alloc, group, table)?;
    let mut keys = Vec::new();
    cluster::for_each_key(alloc, info.cluster, &mut |k| {
        keys.push(k);
        Ok(())
    })?;
    for k in keys {
        if obj_get(alloc, group, table, ObjKey(k), col)? == *value {
            return Ok(Some(ObjKey(k)));
        }
    }
    Ok(None)
}
