//! # Table Spec
//!
//! Column metadata for one table: name, type, attributes, link target, and
//! for system backlink columns the origin (table, column) pair. Persisted
//! under the table top as five parallel arrays:
//!
//! ```text
//! spec top (has_refs): [names_ref, types_ref, attrs_ref, links_ref, origins_ref]
//! ```
//!
//! Column keys are spec slot indices. A removed column leaves a tombstone
//! slot (type code 0) so the keys of the remaining columns never shift; the
//! matching cluster column slot is zeroed the same way.

use eyre::Result;

use crate::alloc::{Allocator, Ref, WriteAlloc};
use crate::array::blobs::ArrayBlobs;
use crate::array::{free_tree, Array};
use crate::cluster::ColumnKind;
use crate::error::{err, ErrorKind};
use crate::node::FLAG_HAS_REFS;
use crate::value::{ColKey, TableKey};

pub const ATTR_NULLABLE: u8 = 0x01;
pub const ATTR_INDEXED: u8 = 0x02;
pub const ATTR_LIST: u8 = 0x04;
pub const ATTR_STRONG_LINKS: u8 = 0x08;
pub const ATTR_PRIMARY: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Bool,
    String,
    Binary,
    Timestamp,
    Float,
    Double,
    Decimal,
    Link,
    ObjectId,
    Mixed,
    Uuid,
    Backlink,
}

impl ColumnType {
    pub fn code(self) -> u8 {
        match self {
            ColumnType::Int => 1,
            ColumnType::Bool => 2,
            ColumnType::String => 3,
            ColumnType::Binary => 4,
            ColumnType::Timestamp => 5,
            ColumnType::Float => 6,
            ColumnType::Double => 7,
            ColumnType::Decimal => 8,
            ColumnType::Link => 9,
            ColumnType::ObjectId => 10,
            ColumnType::Mixed => 11,
            ColumnType::Uuid => 12,
            ColumnType::Backlink => 13,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => ColumnType::Int,
            2 => ColumnType::Bool,
            3 => ColumnType::String,
            4 => ColumnType::Binary,
            5 => ColumnType::Timestamp,
            6 => ColumnType::Float,
            7 => ColumnType::Double,
            8 => ColumnType::Decimal,
            9 => ColumnType::Link,
            10 => ColumnType::ObjectId,
            11 => ColumnType::Mixed,
            12 => ColumnType::Uuid,
            13 => ColumnType::Backlink,
            other => {
                return Err(err(ErrorKind::InvalidDatabase(format!(
                    "unknown column type code {}",
                    other
                ))))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub attrs: u8,
    /// Link columns: the target table. Backlink columns: the origin table.
    pub peer_table: Option<TableKey>,
    /// Backlink columns: the origin link column.
    pub origin_col: Option<ColKey>,
}

impl ColumnSpec {
    pub fn is_nullable(&self) -> bool {
        self.attrs & ATTR_NULLABLE != 0
    }

    pub fn is_list(&self) -> bool {
        self.attrs & ATTR_LIST != 0
    }

    pub fn is_indexed(&self) -> bool {
        self.attrs & ATTR_INDEXED != 0
    }

    pub fn is_strong(&self) -> bool {
        self.attrs & ATTR_STRONG_LINKS != 0
    }

    pub fn is_primary(&self) -> bool {
        self.attrs & ATTR_PRIMARY != 0
    }

    /// Physical storage layout for this column's cluster arrays.
    pub fn kind(&self) -> ColumnKind {
        if self.ty == ColumnType::Backlink {
            ColumnKind::Backlinks
        } else if self.is_list() {
            ColumnKind::Refs
        } else if self.ty == ColumnType::Link {
            ColumnKind::Keys
        } else {
            match self.ty {
                ColumnType::Int | ColumnType::Bool | ColumnType::Float | ColumnType::Double => {
                    ColumnKind::Ints
                }
                _ => ColumnKind::Blobs,
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub columns: Vec<Option<ColumnSpec>>,
}

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<A: Allocator + ?Sized>(alloc: &A, r: Ref) -> Result<Self> {
        let top = Array::load(alloc, r)?;
        if top.len() != 5 {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "spec top has {} slots",
                top.len()
            ))));
        }
        let names = ArrayBlobs::load(alloc, top.get(0) as Ref)?.items;
        let types = Array::load(alloc, top.get(1) as Ref)?.values;
        let attrs = Array::load(alloc, top.get(2) as Ref)?.values;
        let links = Array::load(alloc, top.get(3) as Ref)?.values;
        let origins = Array::load(alloc, top.get(4) as Ref)?.values;
        if [types.len(), attrs.len(), links.len(), origins.len()]
            .iter()
            .any(|&n| n != names.len())
        {
            return Err(err(ErrorKind::InvalidDatabase(
                "spec arrays disagree on column count".into(),
            )));
        }

        let mut columns = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            if types[i] == 0 {
                columns.push(None);
                continue;
            }
            let name = String::from_utf8(names[i].clone().unwrap_or_default())
                .map_err(|_| err(ErrorKind::InvalidDatabase("non-UTF-8 column name".into())))?;
            columns.push(Some(ColumnSpec {
                name,
                ty: ColumnType::from_code(types[i] as u8)?,
                attrs: attrs[i] as u8,
                peer_table: match links[i] {
                    0 => None,
                    t => Some(TableKey((t - 1) as u32)),
                },
                origin_col: match origins[i] {
                    0 => None,
                    c => Some(ColKey((c - 1) as u32)),
                },
            }));
        }
        Ok(Self { columns })
    }

    pub fn store(&self, tx: &mut WriteAlloc) -> Result<Ref> {
        let mut names = Vec::with_capacity(self.columns.len());
        let mut types = Vec::with_capacity(self.columns.len());
        let mut attrs = Vec::with_capacity(self.columns.len());
        let mut links = Vec::with_capacity(self.columns.len());
        let mut origins = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            match col {
                Some(c) => {
                    names.push(Some(c.name.as_bytes().to_vec()));
                    types.push(c.ty.code() as i64);
                    attrs.push(c.attrs as i64);
                    links.push(c.peer_table.map(|t| t.0 as i64 + 1).unwrap_or(0));
                    origins.push(c.origin_col.map(|c| c.0 as i64 + 1).unwrap_or(0));
                }
                None => {
                    names.push(None);
                    types.push(0);
                    attrs.push(0);
                    links.push(0);
                    origins.push(0);
                }
            }
        }
        let names_ref = ArrayBlobs::from_items(names).store(tx)?;
        let types_ref = Array::from_values(0, types).store(tx)?;
        let attrs_ref = Array::from_values(0, attrs).store(tx)?;
        let links_ref = Array::from_values(0, links).store(tx)?;
        let origins_ref = Array::from_values(0, origins).store(tx)?;
        Array::from_values(
            FLAG_HAS_REFS,
            vec![
                names_ref as i64,
                types_ref as i64,
                attrs_ref as i64,
                links_ref as i64,
                origins_ref as i64,
            ],
        )
        .store(tx)
    }

    /// Frees a stored spec composite (children are exclusively owned).
    pub fn free_stored(tx: &mut WriteAlloc, r: Ref) -> Result<()> {
        free_tree(tx, r)
    }

    pub fn col(&self, key: ColKey) -> Result<&ColumnSpec> {
        self.columns
            .get(key.0 as usize)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| {
                err(ErrorKind::LogicError(format!(
                    "column key {} does not exist",
                    key.0
                )))
            })
    }

    pub fn add(&mut self, column: ColumnSpec) -> ColKey {
        self.columns.push(Some(column));
        ColKey((self.columns.len() - 1) as u32)
    }

    pub fn erase(&mut self, key: ColKey) -> Result<ColumnSpec> {
        let slot = self
            .columns
            .get_mut(key.0 as usize)
            .ok_or_else(|| {
                err(ErrorKind::LogicError(format!(
                    "column key {} does not exist",
                    key.0
                )))
            })?;
        slot.take().ok_or_else(|| {
            err(ErrorKind::LogicError(format!(
                "column key {} already removed",
                key.0
            )))
        })
    }

    /// Finds a user-visible column by name (backlink columns excluded).
    pub fn find_public(&self, name: &str) -> Option<ColKey> {
        self.columns.iter().enumerate().find_map(|(i, c)| match c {
            Some(c) if c.ty != ColumnType::Backlink && c.name == name => {
                Some(ColKey(i as u32))
            }
            _ => None,
        })
    }

    /// User-visible columns in slot order.
    pub fn public_columns(&self) -> impl Iterator<Item = (ColKey, &ColumnSpec)> {
        self.columns.iter().enumerate().filter_map(|(i, c)| match c {
            Some(c) if c.ty != ColumnType::Backlink => Some((ColKey(i as u32), c)),
            _ => None,
        })
    }

    pub fn public_column_count(&self) -> usize {
        self.public_columns().count()
    }

    /// The backlink column in this spec that mirrors `origin_col` of
    /// `origin_table`.
    pub fn backlink_col_for(&self, origin_table: TableKey, origin_col: ColKey) -> Option<ColKey> {
        self.columns.iter().enumerate().find_map(|(i, c)| match c {
            Some(c)
                if c.ty == ColumnType::Backlink
                    && c.peer_table == Some(origin_table)
                    && c.origin_col == Some(origin_col) =>
            {
                Some(ColKey(i as u32))
            }
            _ => None,
        })
    }

    /// All backlink columns (origin table, origin column, backlink column).
    pub fn backlink_columns(&self) -> Vec<(TableKey, ColKey, ColKey)> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Some(c) if c.ty == ColumnType::Backlink => {
                    Some((c.peer_table?, c.origin_col?, ColKey(i as u32)))
                }
                _ => None,
            })
            .collect()
    }

    pub fn primary_key_col(&self) -> Option<ColKey> {
        self.columns.iter().enumerate().find_map(|(i, c)| match c {
            Some(c) if c.is_primary() => Some(ColKey(i as u32)),
            _ => None,
        })
    }

    /// Cluster column layouts by slot (None for tombstones).
    pub fn kinds(&self) -> Vec<Option<ColumnKind>> {
        self.columns
            .iter()
            .map(|c| c.as_ref().map(|c| c.kind()))
            .collect()
    }
}

/// Generated name for a system backlink column.
pub fn backlink_column_name(origin_table: TableKey, origin_col: ColKey) -> String {
    format!("!backlink_{}_{}", origin_table.0, origin_col.0)
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

    fn int_col(name: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            ty: ColumnType::Int,
            attrs: 0,
            peer_table: None,
            origin_col: None,
        }
    }

    #[test]
    fn spec_roundtrip() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut spec = Spec::new();
        spec.add(int_col("value"));
        spec.add(ColumnSpec {
            name: "friend".into(),
            ty: ColumnType::Link,
            attrs: ATTR_STRONG_LINKS,
            peer_table: Some(TableKey(3)),
            origin_col: None,
        });
        spec.add(ColumnSpec {
            name: backlink_column_name(TableKey(1), ColKey(0)),
            ty: ColumnType::Backlink,
            attrs: 0,
            peer_table: Some(TableKey(1)),
            origin_col: Some(ColKey(0)),
        });

        let r = spec.store(&mut tx).unwrap();
        let back = Spec::load(&tx, r).unwrap();
        assert_eq!(back.columns, spec.columns);
    }

    #[test]
    fn tombstone_keeps_keys_stable() {
        let slab = slab();
        let mut tx = txn(&slab);
        let mut spec = Spec::new();
        let k0 = spec.add(int_col("a"));
        let k1 = spec.add(int_col("b"));
        spec.erase(k0).unwrap();

        let r = spec.store(&mut tx).unwrap();
        let back = Spec::load(&tx, r).unwrap();
        assert!(back.col(k0).is_err());
        assert_eq!(back.col(k1).unwrap().name, "b");
        assert_eq!(back.find_public("b"), Some(k1));
        assert_eq!(back.public_column_count(), 1);
    }

    #[test]
    fn backlink_columns_are_not_public() {
        let mut spec = Spec::new();
        spec.add(ColumnSpec {
            name: backlink_column_name(TableKey(0), ColKey(0)),
            ty: ColumnType::Backlink,
            attrs: 0,
            peer_table: Some(TableKey(0)),
            origin_col: Some(ColKey(0)),
        });
        assert_eq!(spec.public_column_count(), 0);
        assert_eq!(
            spec.backlink_col_for(TableKey(0), ColKey(0)),
            Some(ColKey(0))
        );
    }

    #[test]
    fn kinds_match_types() {
        let mut spec = Spec::new();
        spec.add(int_col("i"));
        spec.add(ColumnSpec {
            name: "s".into(),
            ty: ColumnType::String,
            attrs: ATTR_NULLABLE,
            peer_table: None,
            origin_col: None,
        });
        spec.add(ColumnSpec {
            name: "l".into(),
            ty: ColumnType::Int,
            attrs: ATTR_LIST,
            peer_table: None,
            origin_col: None,
        });
        assert_eq!(
            spec.kinds(),
            vec![
                Some(ColumnKind::Ints),
                Some(ColumnKind::Blobs),
                Some(ColumnKind::Refs)
            ]
        );
    }

    #[test]
    fn double_erase_fails() {
        let mut spec = Spec::new();
        let k = spec.add(int_col("x"));
        spec.erase(k).unwrap();
        assert!(spec.erase(k).is_err());
    }
}
