//! # Changeset Application
//!
//! Replays a changeset — typically one produced on another device and
//! transformed upstream — through the same table primitives that produced
//! it, with recording suppressed so application does not re-emit
//! instructions. Selection state (`SelectTable`, `SelectCollection`) is
//! tracked across the stream exactly as the encoder wrote it.
//!
//! Operational-transform of concurrent histories happens before a
//! changeset reaches this point; application itself is a literal replay.

use eyre::Result;

use crate::alloc::WriteAlloc;
use crate::error::{err, ErrorKind};
use crate::group::Group;
use crate::repl::{parse_changeset, Instruction, TransactLog};
use crate::table::spec::{ColumnSpec, ColumnType};
use crate::table::{self, fields, lists};
use crate::value::{ColKey, ObjKey, TableKey, Value};

pub fn apply_changeset(tx: &mut WriteAlloc, group: &mut Group, bytes: &[u8]) -> Result<()> {
    let instructions = parse_changeset(bytes)?;
    // Application never records.
    let mut repl: Option<TransactLog> = None;

    let mut table: Option<TableKey> = None;
    let mut collection: Option<(ColKey, ObjKey)> = None;

    let need_table = |table: Option<TableKey>| -> Result<TableKey> {
        table.ok_or_else(|| {
            err(ErrorKind::InvalidDatabase(
                "changeset instruction before table selection".into(),
            ))
        })
    };

    for instr in instructions {
        match instr {
            Instruction::SelectTable { table: t } => {
                if !group.has_table(t) {
                    return Err(err(ErrorKind::InvalidDatabase(format!(
                        "changeset selects unknown table key {}",
                        t.0
                    ))));
                }
                table = Some(t);
                collection = None;
            }
            Instruction::SelectCollection { col, key } => {
                need_table(table)?;
                collection = Some((col, key));
            }
            Instruction::CreateObject { key } => {
                let t = need_table(table)?;
                table::create_object(tx, group, &mut repl, t, Some(key))?;
            }
            Instruction::RemoveObject { key } => {
                let t = need_table(table)?;
                table::remove_object(tx, group, &mut repl, t, key)?;
            }
            Instruction::Set { col, key, value } => {
                let t = need_table(table)?;
                fields::obj_set(tx, group, &mut repl, t, key, col, value, false)?;
            }
            Instruction::SetNull { col, key } => {
                let t = need_table(table)?;
                fields::obj_set(tx, group, &mut repl, t, key, col, Value::Null, false)?;
            }
            Instruction::SetDefault { col, key, value } => {
                let t = need_table(table)?;
                fields::obj_set(tx, group, &mut repl, t, key, col, value, true)?;
            }
            Instruction::AddInt { col, key, delta } => {
                let t = need_table(table)?;
                fields::obj_add_int(tx, group, &mut repl, t, key, col, delta)?;
            }
            Instruction::ListInsert { ndx, value } => {
                let t = need_table(table)?;
                let (col, key) = need_collection(collection)?;
                lists::list_insert(tx, group, &mut repl, t, key, col, ndx, value)?;
            }
            Instruction::ListSet { ndx, value } => {
                let t = need_table(table)?;
                let (col, key) = need_collection(collection)?;
                lists::list_set(tx, group, &mut repl, t, key, col, ndx, value)?;
            }
            Instruction::ListErase { ndx } => {
                let t = need_table(table)?;
                let (col, key) = need_collection(collection)?;
                lists::list_remove(tx, group, &mut repl, t, key, col, ndx)?;
            }
            Instruction::ListClear { .. } => {
                let t = need_table(table)?;
                let (col, key) = need_collection(collection)?;
                lists::list_clear(tx, group, &mut repl, t, key, col)?;
            }
            Instruction::DictInsert { .. }
            | Instruction::DictSet { .. }
            | Instruction::DictErase { .. } => {
                return Err(err(ErrorKind::LogicError(
                    "dictionary instructions are not supported".into(),
                )));
            }
            Instruction::InsertGroupLevelTable {
                table: t,
                name,
                embedded,
            } => {
                table::create_table_at(tx, group, t, &name, embedded)?;
            }
            Instruction::EraseGroupLevelTable { table: t } => {
                table::remove_table(tx, group, &mut repl, t)?;
                if table == Some(t) {
                    table = None;
                    collection = None;
                }
            }
            Instruction::RenameGroupLevelTable { table: t, name } => {
                table::rename_table(tx, group, &mut repl, t, &name)?;
            }
            Instruction::InsertColumn {
                col,
                name,
                type_code,
                attrs,
                target,
            } => {
                let t = need_table(table)?;
                let spec = ColumnSpec {
                    name,
                    ty: ColumnType::from_code(type_code)?,
                    attrs,
                    peer_table: if target == 0 {
                        None
                    } else {
                        Some(TableKey(target - 1))
                    },
                    origin_col: None,
                };
                let assigned = table::add_column(tx, group, &mut repl, t, spec)?;
                if assigned != col {
                    return Err(err(ErrorKind::InvalidDatabase(format!(
                        "changeset column key {} does not match assigned {}",
                        col.0, assigned.0
                    ))));
                }
            }
            Instruction::EraseColumn { col } => {
                let t = need_table(table)?;
                table::remove_column(tx, group, &mut repl, t, col)?;
            }
            Instruction::RenameColumn { col, name } => {
                let t = need_table(table)?;
                table::rename_column(tx, group, &mut repl, t, col, &name)?;
            }
        }
    }
    Ok(())
}

fn need_collection(collection: Option<(ColKey, ObjKey)>) -> Result<(ColKey, ObjKey)> {
    collection.ok_or_else(|| {
        err(ErrorKind::InvalidDatabase(
            "list instruction before collection selection".into(),
        ))
    })
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

    /// Runs the same edits against a recording group, then replays the
    /// produced changeset against a second group and compares observable
    /// state.
    #[test]
    fn recorded_changeset_replays_identically() {
        let (_s1, mut tx1, mut group1) = setup();
        let mut repl = Some(TransactLog::new());

        let t = table::create_table(&mut tx1, &mut group1, &mut repl, "class_item", false).unwrap();
        let c_value = table::add_column(
            &mut tx1,
            &mut group1,
            &mut repl,
            t,
            ColumnSpec {
                name: "value".into(),
                ty: ColumnType::Int,
                attrs: 0,
                peer_table: None,
                origin_col: None,
            },
        )
        .unwrap();
        let k = table::create_object(&mut tx1, &mut group1, &mut repl, t, None).unwrap();
        fields::obj_set(&mut tx1, &mut group1, &mut repl, t, k, c_value, Value::Int(42), false)
            .unwrap();
        let changeset = repl.take().unwrap().into_bytes();

        let (_s2, mut tx2, mut group2) = setup();
        apply_changeset(&mut tx2, &mut group2, &changeset).unwrap();

        let t2 = group2.find_table("class_item").unwrap();
        assert_eq!(t2, t);
        assert_eq!(table::table_size(&tx2, &group2, t2).unwrap(), 1);
        assert_eq!(
            fields::obj_get(&tx2, &group2, t2, k, c_value).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn list_instructions_replay() {
        let (_s1, mut tx1, mut group1) = setup();
        let mut repl = Some(TransactLog::new());
        let t = table::create_table(&mut tx1, &mut group1, &mut repl, "class_l", false).unwrap();
        let c = table::add_column(
            &mut tx1,
            &mut group1,
            &mut repl,
            t,
            ColumnSpec {
                name: "ints".into(),
                ty: ColumnType::Int,
                attrs: crate::table::spec::ATTR_LIST,
                peer_table: None,
                origin_col: None,
            },
        )
        .unwrap();
        let k = table::create_object(&mut tx1, &mut group1, &mut repl, t, None).unwrap();
        for (i, v) in [5i64, 6, 7].iter().enumerate() {
            lists::list_insert(&mut tx1, &mut group1, &mut repl, t, k, c, i, Value::Int(*v))
                .unwrap();
        }
        lists::list_remove(&mut tx1, &mut group1, &mut repl, t, k, c, 1).unwrap();
        let changeset = repl.take().unwrap().into_bytes();

        let (_s2, mut tx2, mut group2) = setup();
        apply_changeset(&mut tx2, &mut group2, &changeset).unwrap();
        let values = lists::list_values(&tx2, &group2, t, k, c).unwrap();
        assert_eq!(values, vec![Value::Int(5), Value::Int(7)]);
    }

    #[test]
    fn remove_object_replays_with_cascade_effects() {
        let (_s1, mut tx1, mut group1) = setup();
        let mut repl = Some(TransactLog::new());
        let t = table::create_table(&mut tx1, &mut group1, &mut repl, "class_t", false).unwrap();
        table::add_column(
            &mut tx1,
            &mut group1,
            &mut repl,
            t,
            ColumnSpec {
                name: "x".into(),
                ty: ColumnType::Int,
                attrs: 0,
                peer_table: None,
                origin_col: None,
            },
        )
        .unwrap();
        let k1 = table::create_object(&mut tx1, &mut group1, &mut repl, t, None).unwrap();
        let _k2 = table::create_object(&mut tx1, &mut group1, &mut repl, t, None).unwrap();
        table::remove_object(&mut tx1, &mut group1, &mut repl, t, k1).unwrap();
        let changeset = repl.take().unwrap().into_bytes();

        let (_s2, mut tx2, mut group2) = setup();
        apply_changeset(&mut tx2, &mut group2, &changeset).unwrap();
        assert_eq!(table::table_size(&tx2, &group2, t).unwrap(), 1);
        assert!(!table::object_exists(&tx2, &group2, t, k1).unwrap());
    }

    #[test]
    fn dictionary_instructions_are_rejected() {
        let (_s, mut tx, mut group) = setup();
        let mut log = TransactLog::new();
        log.insert_group_level_table(TableKey(0), "class_d", false);
        let ok_part = log.data().len();
        log.dictionary_insert(
            TableKey(0),
            ColKey(0),
            ObjKey(0),
            &Value::String("k".into()),
            &Value::Int(1),
        );
        let bytes = log.into_bytes();
        assert!(apply_changeset(&mut tx, &mut group, &bytes).is_err());
        // The prefix alone applies cleanly.
        let (_s2, mut tx2, mut group2) = setup();
        apply_changeset(&mut tx2, &mut group2, &bytes[..ok_part]).unwrap();
    }
}
