//! # Search Index
//!
//! Optional per-column value-to-keys index accelerating `find_first`. The
//! index is purely derivative: nothing is persisted beyond the `indexed`
//! attribute in the spec. Each transaction rebuilds an indexed column's map
//! from the cluster tree the first time it is queried, and any write to the
//! table drops the cached maps, so a stale index can never be observed.

use eyre::Result;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::alloc::{Allocator, WriteAlloc};
use crate::cluster;
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::value::{ColKey, ObjKey, TableKey, Value};

use super::fields::obj_get;
use super::spec::{ColumnType, ATTR_INDEXED};
use super::{load_table, save_table};

/// Hashable normalization of an indexable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Null,
    Int(i64),
    Bool(bool),
    Str(String),
    Timestamp(i64, u32),
}

impl IndexKey {
    pub fn from_value(value: &Value) -> Option<IndexKey> {
        Some(match value {
            Value::Null => IndexKey::Null,
            Value::Int(v) => IndexKey::Int(*v),
            Value::Bool(v) => IndexKey::Bool(*v),
            Value::String(s) => IndexKey::Str(s.clone()),
            Value::Timestamp(t) => IndexKey::Timestamp(t.seconds, t.nanoseconds),
            _ => return None,
        })
    }
}

type ColumnIndex = HashMap<IndexKey, SmallVec<[ObjKey; 2]>>;

/// Per-transaction cache of built column indexes.
#[derive(Debug, Default)]
pub struct SearchIndexes {
    built: HashMap<(TableKey, ColKey), ColumnIndex>,
}

impl SearchIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached map for `table`; called on any write to it.
    pub fn invalidate(&mut self, table: TableKey) {
        self.built.retain(|(t, _), _| *t != table);
    }

    pub fn invalidate_all(&mut self) {
        self.built.clear();
    }

    /// Index-backed `find_first`; builds the column's map on first use.
    pub fn find_first<A: Allocator + ?Sized>(
        &mut self,
        alloc: &A,
        group: &Group,
        table: TableKey,
        col: ColKey,
        value: &Value,
    ) -> Result<Option<ObjKey>> {
        let entry = (table, col);
        if !self.built.contains_key(&entry) {
            let map = build_column_index(alloc, group, table, col)?;
            self.built.insert(entry, map);
        }
        let needle = IndexKey::from_value(value).ok_or_else(|| {
            err(ErrorKind::LogicError(
                "value type is not indexable".into(),
            ))
        })?;
        Ok(self
            .built
            .get(&entry)
            .and_then(|m| m.get(&needle))
            .and_then(|keys| keys.first().copied()))
    }
}

fn build_column_index<A: Allocator + ?Sized>(
    alloc: &A,
    group: &Group,
    table: TableKey,
    col: ColKey,
) -> Result<ColumnIndex> {
    let info = load_table(alloc, group, table)?;
    let mut keys = Vec::new();
    cluster::for_each_key(alloc, info.cluster, &mut |k| {
        keys.push(ObjKey(k));
        Ok(())
    })?;
    let mut map: ColumnIndex = HashMap::new();
    for key in keys {
        let value = obj_get(alloc, group, table, key, col)?;
        if let Some(ik) = IndexKey::from_value(&value) {
            map.entry(ik).or_default().push(key);
        }
    }
    Ok(map)
}

/// Checks that a column type supports indexing.
pub fn indexable(ty: ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::Int | ColumnType::Bool | ColumnType::String | ColumnType::Timestamp
    )
}

/// Toggles the `indexed` attribute of a column.
pub fn set_search_index(
    tx: &mut WriteAlloc,
    group: &mut Group,
    table: TableKey,
    col: ColKey,
    on: bool,
) -> Result<()> {
    let mut info = load_table(tx, group, table)?;
    {
        let spec = info.spec.col(col)?;
        if spec.is_list() || !indexable(spec.ty) {
            return Err(err(ErrorKind::LogicError(format!(
                "column '{}' cannot carry a search index",
                spec.name
            ))));
        }
    }
    let slot = info
        .spec
        .columns
        .get_mut(col.0 as usize)
        .and_then(|c| c.as_mut())
        .expect("checked above");
    if on {
        slot.attrs |= ATTR_INDEXED;
    } else {
        slot.attrs &= !ATTR_INDEXED;
    }
    save_table(tx, group, &mut info, true)
}
