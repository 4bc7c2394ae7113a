//! # Values
//!
//! The dynamic value type flowing through object accessors, mixed columns,
//! and changeset payloads, plus the small key newtypes used across the
//! engine.
//!
//! ## Ordering
//!
//! Values order by type tag first, then by natural value order within a
//! type; strings and binaries compare lexicographically by byte. `Null`
//! carries the lowest tag, so nulls sort below every non-null value in
//! ascending order.

use std::cmp::Ordering;

use eyre::Result;

use crate::encoding::{read_varint, read_varint_signed, write_varint, write_varint_signed};
use crate::error::{err, ErrorKind};

/// Stable object identity within one table. 63-bit value space; the sign
/// bit marks an unresolved key (a tombstone for a link whose target has not
/// synced in yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjKey(pub i64);

impl ObjKey {
    pub fn is_unresolved(&self) -> bool {
        self.0 < 0
    }
}

/// Identity of a table within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey(pub u32);

/// Identity of a column within a table's spec. Column keys are stable:
/// removing a column tombstones its spec slot rather than shifting others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColKey(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Decimal128(pub [u8; 16]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub [u8; 12]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(pub [u8; 16]);

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    String(String),
    Binary(Vec<u8>),
    Timestamp(Timestamp),
    Float(f32),
    Double(f64),
    Decimal(Decimal128),
    Link(ObjKey),
    ObjectId(ObjectId),
    TypedLink(TableKey, ObjKey),
    Uuid(Uuid),
}

impl Value {
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Bool(_) => 2,
            Value::String(_) => 3,
            Value::Binary(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Float(_) => 6,
            Value::Double(_) => 7,
            Value::Decimal(_) => 8,
            Value::Link(_) => 9,
            Value::ObjectId(_) => 10,
            Value::TypedLink(..) => 11,
            Value::Uuid(_) => 12,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Serializes the value as a self-describing payload (tag + operand).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.type_tag());
        match self {
            Value::Null => {}
            Value::Int(v) => write_varint_signed(out, *v),
            Value::Bool(v) => out.push(*v as u8),
            Value::String(s) => {
                write_varint(out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Binary(b) => {
                write_varint(out, b.len() as u64);
                out.extend_from_slice(b);
            }
            Value::Timestamp(t) => {
                write_varint_signed(out, t.seconds);
                write_varint(out, t.nanoseconds as u64);
            }
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Decimal(d) => out.extend_from_slice(&d.0),
            Value::Link(k) => write_varint_signed(out, k.0),
            Value::ObjectId(o) => out.extend_from_slice(&o.0),
            Value::TypedLink(t, k) => {
                write_varint(out, t.0 as u64);
                write_varint_signed(out, k.0);
            }
            Value::Uuid(u) => out.extend_from_slice(&u.0),
        }
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Value> {
        if *pos >= buf.len() {
            return Err(err(ErrorKind::InvalidDatabase(
                "truncated value payload".into(),
            )));
        }
        let tag = buf[*pos];
        *pos += 1;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            if *pos + n > buf.len() {
                return Err(err(ErrorKind::InvalidDatabase(
                    "truncated value payload".into(),
                )));
            }
            let s = &buf[*pos..*pos + n];
            *pos += n;
            Ok(s)
        };
        Ok(match tag {
            0 => Value::Null,
            1 => Value::Int(read_varint_signed(buf, pos)?),
            2 => Value::Bool(take(pos, 1)?[0] != 0),
            3 => {
                let len = read_varint(buf, pos)? as usize;
                let bytes = take(pos, len)?;
                Value::String(
                    std::str::from_utf8(bytes)
                        .map_err(|_| {
                            err(ErrorKind::InvalidDatabase("non-UTF-8 string payload".into()))
                        })?
                        .to_owned(),
                )
            }
            4 => {
                let len = read_varint(buf, pos)? as usize;
                Value::Binary(take(pos, len)?.to_vec())
            }
            5 => Value::Timestamp(Timestamp {
                seconds: read_varint_signed(buf, pos)?,
                nanoseconds: read_varint(buf, pos)? as u32,
            }),
            6 => {
                let raw: [u8; 4] = take(pos, 4)?.try_into().unwrap();
                Value::Float(f32::from_bits(u32::from_le_bytes(raw)))
            }
            7 => {
                let raw: [u8; 8] = take(pos, 8)?.try_into().unwrap();
                Value::Double(f64::from_bits(u64::from_le_bytes(raw)))
            }
            8 => Value::Decimal(Decimal128(take(pos, 16)?.try_into().unwrap())),
            9 => Value::Link(ObjKey(read_varint_signed(buf, pos)?)),
            10 => Value::ObjectId(ObjectId(take(pos, 12)?.try_into().unwrap())),
            11 => {
                let table = read_varint(buf, pos)? as u32;
                let key = read_varint_signed(buf, pos)?;
                Value::TypedLink(TableKey(table), ObjKey(key))
            }
            12 => Value::Uuid(Uuid(take(pos, 16)?.try_into().unwrap())),
            _ => {
                return Err(err(ErrorKind::InvalidDatabase(format!(
                    "unknown value tag {}",
                    tag
                ))))
            }
        })
    }

    /// Total order: type tag first, then value. Floats use IEEE total
    /// ordering so the result is a proper `Ordering` even with NaN.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        let tags = self.type_tag().cmp(&other.type_tag());
        if tags != Ordering::Equal {
            return tags;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::TypedLink(at, ak), Value::TypedLink(bt, bk)) => {
                at.cmp(bt).then(ak.cmp(bk))
            }
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            _ => unreachable!("tags already compared"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}
