//! # Replication
//!
//! Every mutating primitive on tables, objects and lists reports itself to
//! the write transaction's replication sink. The sink serializes a compact
//! TLV instruction stream — the **changeset** — which is appended to the
//! group's history at commit and can later be replayed on another file with
//! [`apply_changeset`](crate::repl::apply::apply_changeset).
//!
//! ## Stream Format
//!
//! Each instruction is one code byte followed by varint operands (see
//! [`crate::encoding`]). Value payloads use the self-describing encoding of
//! [`crate::value::Value`]. The stream carries selection state: `SelectTable`
//! and `SelectCollection` scope the instructions that follow, so per-row
//! instructions stay small. Instruction order equals program order within
//! the transaction.
//!
//! Backward-compatible format evolution appends new codes with higher
//! numeric values; an unknown code fails parsing.

pub mod apply;
pub mod history;

use eyre::Result;

use crate::encoding::{read_varint, read_varint_signed, write_varint, write_varint_signed};
use crate::error::{err, ErrorKind};
use crate::value::{ColKey, ObjKey, TableKey, Value};

pub const INSTR_SELECT_TABLE: u8 = 1;
pub const INSTR_SELECT_COLLECTION: u8 = 2;
pub const INSTR_CREATE_OBJECT: u8 = 3;
pub const INSTR_REMOVE_OBJECT: u8 = 4;
pub const INSTR_SET: u8 = 5;
pub const INSTR_SET_NULL: u8 = 6;
pub const INSTR_SET_DEFAULT: u8 = 7;
pub const INSTR_ADD_INT: u8 = 8;
pub const INSTR_LIST_INSERT: u8 = 9;
pub const INSTR_LIST_SET: u8 = 10;
pub const INSTR_LIST_ERASE: u8 = 11;
pub const INSTR_LIST_CLEAR: u8 = 12;
pub const INSTR_DICT_INSERT: u8 = 13;
pub const INSTR_DICT_SET: u8 = 14;
pub const INSTR_DICT_ERASE: u8 = 15;
pub const INSTR_INSERT_GROUP_LEVEL_TABLE: u8 = 16;
pub const INSTR_ERASE_GROUP_LEVEL_TABLE: u8 = 17;
pub const INSTR_RENAME_GROUP_LEVEL_TABLE: u8 = 18;
pub const INSTR_INSERT_COLUMN: u8 = 19;
pub const INSTR_ERASE_COLUMN: u8 = 20;
pub const INSTR_RENAME_COLUMN: u8 = 21;

/// Parsed form of one changeset instruction. Column metadata stays in raw
/// numeric form here; the apply layer translates it back into spec terms.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    SelectTable {
        table: TableKey,
    },
    SelectCollection {
        col: ColKey,
        key: ObjKey,
    },
    CreateObject {
        key: ObjKey,
    },
    RemoveObject {
        key: ObjKey,
    },
    Set {
        col: ColKey,
        key: ObjKey,
        value: Value,
    },
    SetNull {
        col: ColKey,
        key: ObjKey,
    },
    SetDefault {
        col: ColKey,
        key: ObjKey,
        value: Value,
    },
    AddInt {
        col: ColKey,
        key: ObjKey,
        delta: i64,
    },
    ListInsert {
        ndx: usize,
        value: Value,
    },
    ListSet {
        ndx: usize,
        value: Value,
    },
    ListErase {
        ndx: usize,
    },
    ListClear {
        old_size: usize,
    },
    DictInsert {
        key: Value,
        value: Value,
    },
    DictSet {
        key: Value,
        value: Value,
    },
    DictErase {
        key: Value,
    },
    InsertGroupLevelTable {
        table: TableKey,
        name: String,
        embedded: bool,
    },
    EraseGroupLevelTable {
        table: TableKey,
    },
    RenameGroupLevelTable {
        table: TableKey,
        name: String,
    },
    InsertColumn {
        col: ColKey,
        name: String,
        type_code: u8,
        attrs: u8,
        target: u32,
    },
    EraseColumn {
        col: ColKey,
    },
    RenameColumn {
        col: ColKey,
        name: String,
    },
}

/// The replication sink installed for the lifetime of one write
/// transaction. Mutating primitives call the hook methods; the sink keeps
/// selection state so repeated operations on the same table or collection
/// encode compactly.
#[derive(Debug, Default)]
pub struct TransactLog {
    buf: Vec<u8>,
    selected_table: Option<TableKey>,
    selected_collection: Option<(TableKey, ColKey, ObjKey)>,
}

impl TransactLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn ensure_table(&mut self, table: TableKey) {
        if self.selected_table != Some(table) {
            self.buf.push(INSTR_SELECT_TABLE);
            write_varint(&mut self.buf, table.0 as u64);
            self.selected_table = Some(table);
            self.selected_collection = None;
        }
    }

    fn ensure_collection(&mut self, table: TableKey, col: ColKey, key: ObjKey) {
        self.ensure_table(table);
        if self.selected_collection != Some((table, col, key)) {
            self.buf.push(INSTR_SELECT_COLLECTION);
            write_varint(&mut self.buf, col.0 as u64);
            write_varint_signed(&mut self.buf, key.0);
            self.selected_collection = Some((table, col, key));
        }
    }

    pub fn create_object(&mut self, table: TableKey, key: ObjKey) {
        self.ensure_table(table);
        self.buf.push(INSTR_CREATE_OBJECT);
        write_varint_signed(&mut self.buf, key.0);
    }

    pub fn remove_object(&mut self, table: TableKey, key: ObjKey) {
        self.ensure_table(table);
        self.buf.push(INSTR_REMOVE_OBJECT);
        write_varint_signed(&mut self.buf, key.0);
    }

    pub fn set(&mut self, table: TableKey, col: ColKey, key: ObjKey, value: &Value) {
        self.ensure_table(table);
        if value.is_null() {
            self.buf.push(INSTR_SET_NULL);
            write_varint(&mut self.buf, col.0 as u64);
            write_varint_signed(&mut self.buf, key.0);
        } else {
            self.buf.push(INSTR_SET);
            write_varint(&mut self.buf, col.0 as u64);
            write_varint_signed(&mut self.buf, key.0);
            value.encode(&mut self.buf);
        }
    }

    pub fn set_default(&mut self, table: TableKey, col: ColKey, key: ObjKey, value: &Value) {
        self.ensure_table(table);
        self.buf.push(INSTR_SET_DEFAULT);
        write_varint(&mut self.buf, col.0 as u64);
        write_varint_signed(&mut self.buf, key.0);
        value.encode(&mut self.buf);
    }

    pub fn add_int(&mut self, table: TableKey, col: ColKey, key: ObjKey, delta: i64) {
        self.ensure_table(table);
        self.buf.push(INSTR_ADD_INT);
        write_varint(&mut self.buf, col.0 as u64);
        write_varint_signed(&mut self.buf, key.0);
        write_varint_signed(&mut self.buf, delta);
    }

    pub fn list_insert(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Value,
    ) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_LIST_INSERT);
        write_varint(&mut self.buf, ndx as u64);
        value.encode(&mut self.buf);
    }

    pub fn list_set(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Value,
    ) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_LIST_SET);
        write_varint(&mut self.buf, ndx as u64);
        value.encode(&mut self.buf);
    }

    pub fn list_erase(&mut self, table: TableKey, col: ColKey, key: ObjKey, ndx: usize) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_LIST_ERASE);
        write_varint(&mut self.buf, ndx as u64);
    }

    pub fn list_clear(&mut self, table: TableKey, col: ColKey, key: ObjKey, old_size: usize) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_LIST_CLEAR);
        write_varint(&mut self.buf, old_size as u64);
    }

    pub fn dictionary_insert(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        dict_key: &Value,
        value: &Value,
    ) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_DICT_INSERT);
        dict_key.encode(&mut self.buf);
        value.encode(&mut self.buf);
    }

    pub fn dictionary_set(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        dict_key: &Value,
        value: &Value,
    ) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_DICT_SET);
        dict_key.encode(&mut self.buf);
        value.encode(&mut self.buf);
    }

    pub fn dictionary_erase(&mut self, table: TableKey, col: ColKey, key: ObjKey, dict_key: &Value) {
        self.ensure_collection(table, col, key);
        self.buf.push(INSTR_DICT_ERASE);
        dict_key.encode(&mut self.buf);
    }

    pub fn insert_group_level_table(&mut self, table: TableKey, name: &str, embedded: bool) {
        self.selected_table = None;
        self.selected_collection = None;
        self.buf.push(INSTR_INSERT_GROUP_LEVEL_TABLE);
        write_varint(&mut self.buf, table.0 as u64);
        write_string(&mut self.buf, name);
        self.buf.push(embedded as u8);
    }

    pub fn erase_group_level_table(&mut self, table: TableKey) {
        self.selected_table = None;
        self.selected_collection = None;
        self.buf.push(INSTR_ERASE_GROUP_LEVEL_TABLE);
        write_varint(&mut self.buf, table.0 as u64);
    }

    pub fn rename_group_level_table(&mut self, table: TableKey, name: &str) {
        self.buf.push(INSTR_RENAME_GROUP_LEVEL_TABLE);
        write_varint(&mut self.buf, table.0 as u64);
        write_string(&mut self.buf, name);
    }

    pub fn insert_column(
        &mut self,
        table: TableKey,
        col: ColKey,
        name: &str,
        type_code: u8,
        attrs: u8,
        target: u32,
    ) {
        self.ensure_table(table);
        self.buf.push(INSTR_INSERT_COLUMN);
        write_varint(&mut self.buf, col.0 as u64);
        write_string(&mut self.buf, name);
        self.buf.push(type_code);
        self.buf.push(attrs);
        write_varint(&mut self.buf, target as u64);
    }

    pub fn erase_column(&mut self, table: TableKey, col: ColKey) {
        self.ensure_table(table);
        self.buf.push(INSTR_ERASE_COLUMN);
        write_varint(&mut self.buf, col.0 as u64);
    }

    pub fn rename_column(&mut self, table: TableKey, col: ColKey, name: &str) {
        self.ensure_table(table);
        self.buf.push(INSTR_RENAME_COLUMN);
        write_varint(&mut self.buf, col.0 as u64);
        write_string(&mut self.buf, name);
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(buf, pos)? as usize;
    if *pos + len > buf.len() {
        return Err(err(ErrorKind::InvalidDatabase(
            "truncated string in changeset".into(),
        )));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| err(ErrorKind::InvalidDatabase("non-UTF-8 name in changeset".into())))?
        .to_owned();
    *pos += len;
    Ok(s)
}

/// Parses a whole changeset into its instruction sequence.
pub fn parse_changeset(buf: &[u8]) -> Result<Vec<Instruction>> {
    let mut pos = 0usize;
    let mut out = Vec::new();
    while pos < buf.len() {
        out.push(parse_one(buf, &mut pos)?);
    }
    Ok(out)
}

fn parse_one(buf: &[u8], pos: &mut usize) -> Result<Instruction> {
    let code = buf[*pos];
    *pos += 1;
    Ok(match code {
        INSTR_SELECT_TABLE => Instruction::SelectTable {
            table: TableKey(read_varint(buf, pos)? as u32),
        },
        INSTR_SELECT_COLLECTION => Instruction::SelectCollection {
            col: ColKey(read_varint(buf, pos)? as u32),
            key: ObjKey(read_varint_signed(buf, pos)?),
        },
        INSTR_CREATE_OBJECT => Instruction::CreateObject {
            key: ObjKey(read_varint_signed(buf, pos)?),
        },
        INSTR_REMOVE_OBJECT => Instruction::RemoveObject {
            key: ObjKey(read_varint_signed(buf, pos)?),
        },
        INSTR_SET => Instruction::Set {
            col: ColKey(read_varint(buf, pos)? as u32),
            key: ObjKey(read_varint_signed(buf, pos)?),
            value: Value::decode(buf, pos)?,
        },
        INSTR_SET_NULL => Instruction::SetNull {
            col: ColKey(read_varint(buf, pos)? as u32),
            key: ObjKey(read_varint_signed(buf, pos)?),
        },
        INSTR_SET_DEFAULT => Instruction::SetDefault {
            col: ColKey(read_varint(buf, pos)? as u32),
            key: ObjKey(read_varint_signed(buf, pos)?),
            value: Value::decode(buf, pos)?,
        },
        INSTR_ADD_INT => Instruction::AddInt {
            col: ColKey(read_varint(buf, pos)? as u32),
            key: ObjKey(read_varint_signed(buf, pos)?),
            delta: read_varint_signed(buf, pos)?,
        },
        INSTR_LIST_INSERT => Instruction::ListInsert {
            ndx: read_varint(buf, pos)? as usize,
            value: Value::decode(buf, pos)?,
        },
        INSTR_LIST_SET => Instruction::ListSet {
            ndx: read_varint(buf, pos)? as usize,
            value: Value::decode(buf, pos)?,
        },
        INSTR_LIST_ERASE => Instruction::ListErase {
            ndx: read_varint(buf, pos)? as usize,
        },
        INSTR_LIST_CLEAR => Instruction::ListClear {
            old_size: read_varint(buf, pos)? as usize,
        },
        INSTR_DICT_INSERT => Instruction::DictInsert {
            key: Value::decode(buf, pos)?,
            value: Value::decode(buf, pos)?,
        },
        INSTR_DICT_SET => Instruction::DictSet {
            key: Value::decode(buf, pos)?,
            value: Value::decode(buf, pos)?,
        },
        INSTR_DICT_ERASE => Instruction::DictErase {
            key: Value::decode(buf, pos)?,
        },
        INSTR_INSERT_GROUP_LEVEL_TABLE => {
            let table = TableKey(read_varint(buf, pos)? as u32);
            let name = read_string(buf, pos)?;
            if *pos >= buf.len() {
                return Err(err(ErrorKind::InvalidDatabase(
                    "truncated table instruction".into(),
                )));
            }
            let embedded = buf[*pos] != 0;
            *pos += 1;
            Instruction::InsertGroupLevelTable {
                table,
                name,
                embedded,
            }
        }
        INSTR_ERASE_GROUP_LEVEL_TABLE => Instruction::EraseGroupLevelTable {
            table: TableKey(read_varint(buf, pos)? as u32),
        },
        INSTR_RENAME_GROUP_LEVEL_TABLE => Instruction::RenameGroupLevelTable {
            table: TableKey(read_varint(buf, pos)? as u32),
            name: read_string(buf, pos)?,
        },
        INSTR_INSERT_COLUMN => {
            let col = ColKey(read_varint(buf, pos)? as u32);
            let name = read_string(buf, pos)?;
            if *pos + 2 > buf.len() {
                return Err(err(ErrorKind::InvalidDatabase(
                    "truncated column instruction".into(),
                )));
            }
            let type_code = buf[*pos];
            let attrs = buf[*pos + 1];
            *pos += 2;
            let target = read_varint(buf, pos)? as u32;
            Instruction::InsertColumn {
                col,
                name,
                type_code,
                attrs,
                target,
            }
        }
        INSTR_ERASE_COLUMN => Instruction::EraseColumn {
            col: ColKey(read_varint(buf, pos)? as u32),
        },
        INSTR_RENAME_COLUMN => Instruction::RenameColumn {
            col: ColKey(read_varint(buf, pos)? as u32),
            name: read_string(buf, pos)?,
        },
        other => {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "unknown changeset instruction code {}",
                other
            ))))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_produces_empty_changeset() {
        let log = TransactLog::new();
        assert!(log.is_empty());
        assert!(parse_changeset(log.data()).unwrap().is_empty());
    }

    #[test]
    fn table_selection_is_emitted_once() {
        let mut log = TransactLog::new();
        let t = TableKey(2);
        log.create_object(t, ObjKey(1));
        log.create_object(t, ObjKey(2));
        let parsed = parse_changeset(log.data()).unwrap();
        assert_eq!(
            parsed,
            vec![
                Instruction::SelectTable { table: t },
                Instruction::CreateObject { key: ObjKey(1) },
                Instruction::CreateObject { key: ObjKey(2) },
            ]
        );
    }

    #[test]
    fn table_switch_reselects() {
        let mut log = TransactLog::new();
        log.create_object(TableKey(1), ObjKey(1));
        log.create_object(TableKey(2), ObjKey(1));
        log.create_object(TableKey(1), ObjKey(2));
        let parsed = parse_changeset(log.data()).unwrap();
        let selects = parsed
            .iter()
            .filter(|i| matches!(i, Instruction::SelectTable { .. }))
            .count();
        assert_eq!(selects, 3);
    }

    #[test]
    fn null_set_becomes_set_null() {
        let mut log = TransactLog::new();
        log.set(TableKey(0), ColKey(1), ObjKey(5), &Value::Null);
        let parsed = parse_changeset(log.data()).unwrap();
        assert_eq!(
            parsed[1],
            Instruction::SetNull {
                col: ColKey(1),
                key: ObjKey(5)
            }
        );
    }

    #[test]
    fn set_carries_value_payload() {
        let mut log = TransactLog::new();
        log.set(
            TableKey(0),
            ColKey(3),
            ObjKey(7),
            &Value::String("abc".into()),
        );
        let parsed = parse_changeset(log.data()).unwrap();
        assert_eq!(
            parsed[1],
            Instruction::Set {
                col: ColKey(3),
                key: ObjKey(7),
                value: Value::String("abc".into())
            }
        );
    }

    #[test]
    fn list_ops_share_collection_selection() {
        let mut log = TransactLog::new();
        let (t, c, k) = (TableKey(1), ColKey(2), ObjKey(3));
        log.list_insert(t, c, k, 0, &Value::Int(10));
        log.list_set(t, c, k, 0, &Value::Int(20));
        log.list_erase(t, c, k, 0);
        let parsed = parse_changeset(log.data()).unwrap();
        let selects = parsed
            .iter()
            .filter(|i| matches!(i, Instruction::SelectCollection { .. }))
            .count();
        assert_eq!(selects, 1);
        assert_eq!(parsed.len(), 5); // select_table, select_collection, 3 ops
    }

    #[test]
    fn schema_instructions_roundtrip() {
        let mut log = TransactLog::new();
        log.insert_group_level_table(TableKey(4), "class_person", false);
        log.insert_column(TableKey(4), ColKey(0), "age", 1, 0, 0);
        log.rename_column(TableKey(4), ColKey(0), "years");
        log.erase_column(TableKey(4), ColKey(0));
        log.erase_group_level_table(TableKey(4));
        let parsed = parse_changeset(log.data()).unwrap();
        assert!(matches!(
            parsed[0],
            Instruction::InsertGroupLevelTable { ref name, embedded: false, .. } if name == "class_person"
        ));
        assert!(matches!(parsed.last(), Some(Instruction::EraseGroupLevelTable { .. })));
    }

    #[test]
    fn program_order_is_preserved() {
        let mut log = TransactLog::new();
        let t = TableKey(0);
        log.create_object(t, ObjKey(1));
        log.set(t, ColKey(0), ObjKey(1), &Value::Int(5));
        log.add_int(t, ColKey(0), ObjKey(1), 2);
        log.remove_object(t, ObjKey(1));
        let parsed = parse_changeset(log.data()).unwrap();
        let kinds: Vec<_> = parsed
            .iter()
            .map(|i| std::mem::discriminant(i))
            .collect();
        assert_eq!(kinds.len(), 5);
        assert!(matches!(parsed[4], Instruction::RemoveObject { .. }));
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(parse_changeset(&[99]).is_err());
    }

    #[test]
    fn dictionary_instructions_roundtrip() {
        let mut log = TransactLog::new();
        log.dictionary_insert(
            TableKey(0),
            ColKey(1),
            ObjKey(2),
            &Value::String("k".into()),
            &Value::Int(1),
        );
        log.dictionary_erase(TableKey(0), ColKey(1), ObjKey(2), &Value::String("k".into()));
        let parsed = parse_changeset(log.data()).unwrap();
        assert!(matches!(parsed[2], Instruction::DictInsert { .. }));
        assert!(matches!(parsed[3], Instruction::DictErase { .. }));
    }
}
