//! # Schema Migration
//!
//! Compares the persisted schema against the desired one, classifies the
//! differences, checks them against the schema mode, and applies them under
//! the caller's write transaction. Application order respects dependencies:
//! classes are created before link properties, and removals run last.
//!
//! Atomicity comes for free from copy-on-write: the migrator mutates only
//! the transaction's new slabs, so a failed validation or a throwing
//! migration callback rolls the whole attempt back by abandoning them.
//!
//! The schema version lives in a `metadata` table (one row, one integer
//! column) outside the `class_` namespace.

use eyre::Result;

use crate::db::transaction::{Table, Transaction};
use crate::error::{err, ErrorKind};
use crate::table::spec::ColumnType;
use crate::value::Value;

use super::{
    column_attrs_for, schema_from_transaction, table_name_for_class, Property, Schema,
    NOT_VERSIONED,
};

const METADATA_TABLE: &str = "metadata";
const VERSION_COLUMN: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    /// Verify the schema matches; reject any change and any callback.
    ReadOnly,
    /// Like `ReadOnly`, for immutable images.
    Immutable,
    /// Apply additive changes only; reject a callback.
    Additive,
    /// Apply all changes, invoking the migration callback when the
    /// differences go beyond additive ones.
    #[default]
    Manual,
    /// Discard the file contents and start from the desired schema.
    ResetFile,
}

impl SchemaMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, SchemaMode::ReadOnly | SchemaMode::Immutable)
    }

    pub fn allows_callback(self) -> bool {
        matches!(self, SchemaMode::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    AddClass(String),
    RemoveClass(String),
    AddProperty(String, String),
    RemoveProperty(String, String),
    /// Type, nullability, target or primary-key change; applied as
    /// remove-then-add of the property.
    ReplaceProperty(String, String),
    AddIndex(String, String),
    RemoveIndex(String, String),
}

impl SchemaChange {
    /// Additive changes are safe without a migration.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            SchemaChange::AddClass(_)
                | SchemaChange::AddProperty(..)
                | SchemaChange::AddIndex(..)
                | SchemaChange::RemoveIndex(..)
        )
    }
}

fn property_shape_differs(old: &Property, new: &Property) -> bool {
    old.ty != new.ty
        || old.optional != new.optional
        || old.list != new.list
        || old.primary != new.primary
        || old.object_type != new.object_type
}

/// Differences between the persisted and the desired schema.
pub fn required_changes(old: &Schema, new: &Schema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    for object in new.iter() {
        match old.find(&object.name) {
            None => changes.push(SchemaChange::AddClass(object.name.clone())),
            Some(old_object) => {
                for p in &object.properties {
                    match old_object.property(&p.name) {
                        None => changes.push(SchemaChange::AddProperty(
                            object.name.clone(),
                            p.name.clone(),
                        )),
                        Some(old_p) if property_shape_differs(old_p, p) => changes.push(
                            SchemaChange::ReplaceProperty(object.name.clone(), p.name.clone()),
                        ),
                        Some(old_p) => {
                            if !old_p.indexed && p.indexed {
                                changes.push(SchemaChange::AddIndex(
                                    object.name.clone(),
                                    p.name.clone(),
                                ));
                            } else if old_p.indexed && !p.indexed && !p.primary {
                                changes.push(SchemaChange::RemoveIndex(
                                    object.name.clone(),
                                    p.name.clone(),
                                ));
                            }
                        }
                    }
                }
                for old_p in &old_object.properties {
                    if object.property(&old_p.name).is_none() {
                        changes.push(SchemaChange::RemoveProperty(
                            object.name.clone(),
                            old_p.name.clone(),
                        ));
                    }
                }
            }
        }
    }
    for old_object in old.iter() {
        if new.find(&old_object.name).is_none() {
            changes.push(SchemaChange::RemoveClass(old_object.name.clone()));
        }
    }
    changes
}

pub fn changes_require_migration(changes: &[SchemaChange]) -> bool {
    changes.iter().any(|c| !c.is_additive())
}

/// Rejects change sets the mode does not permit.
pub fn check_mode_allows(mode: SchemaMode, changes: &[SchemaChange]) -> Result<()> {
    match mode {
        SchemaMode::ReadOnly | SchemaMode::Immutable => {
            if let Some(change) = changes.first() {
                return Err(err(ErrorKind::SchemaValidation(format!(
                    "schema change {:?} on a read-only realm",
                    change
                ))));
            }
            Ok(())
        }
        SchemaMode::Additive => {
            if let Some(change) = changes.iter().find(|c| !c.is_additive()) {
                return Err(err(ErrorKind::SchemaValidation(format!(
                    "non-additive schema change {:?} in additive mode",
                    change
                ))));
            }
            Ok(())
        }
        SchemaMode::Manual | SchemaMode::ResetFile => Ok(()),
    }
}

fn add_property(txn: &Transaction, table: &Table<'_>, target: &Schema, p: &Property) -> Result<()> {
    match p.ty {
        ColumnType::Link => {
            let class = p.object_type.as_deref().expect("validated link target");
            let target_embedded = target.find(class).map(|o| o.embedded).unwrap_or(false);
            let target_table = txn
                .get_table(&table_name_for_class(class))?
                .ok_or_else(|| {
                    err(ErrorKind::SchemaValidation(format!(
                        "link target class '{}' has no table",
                        class
                    )))
                })?;
            table.add_column_with_attrs(
                &p.name,
                ColumnType::Link,
                column_attrs_for(p, target_embedded),
                Some(target_table.key()),
            )?;
        }
        _ => {
            table.add_column_with_attrs(&p.name, p.ty, column_attrs_for(p, false), None)?;
        }
    }
    Ok(())
}

/// Applies a change set in dependency order: new classes, then new and
/// replaced properties plus index flips, then removals.
pub fn apply_changes(txn: &Transaction, target: &Schema, changes: &[SchemaChange]) -> Result<()> {
    for change in changes {
        if let SchemaChange::AddClass(class) = change {
            let object = target.find(class).expect("change came from target schema");
            txn.add_table(&table_name_for_class(class), object.embedded)?;
        }
    }

    for change in changes {
        match change {
            SchemaChange::AddClass(class) => {
                let object = target.find(class).expect("change came from target schema");
                let table = txn
                    .get_table(&table_name_for_class(class))?
                    .expect("created above");
                for p in &object.properties {
                    add_property(txn, &table, target, p)?;
                }
            }
            SchemaChange::AddProperty(class, prop) => {
                let object = target.find(class).expect("change came from target schema");
                let p = object.property(prop).expect("change names a property");
                let table = txn
                    .get_table(&table_name_for_class(class))?
                    .expect("existing class");
                add_property(txn, &table, target, p)?;
            }
            SchemaChange::ReplaceProperty(class, prop) => {
                let object = target.find(class).expect("change came from target schema");
                let p = object.property(prop).expect("change names a property");
                let table = txn
                    .get_table(&table_name_for_class(class))?
                    .expect("existing class");
                if let Some(col) = table.column_key(prop)? {
                    table.remove_column(col)?;
                }
                add_property(txn, &table, target, p)?;
            }
            SchemaChange::AddIndex(class, prop) | SchemaChange::RemoveIndex(class, prop) => {
                let table = txn
                    .get_table(&table_name_for_class(class))?
                    .expect("existing class");
                let col = table.column_key(prop)?.ok_or_else(|| {
                    err(ErrorKind::SchemaValidation(format!(
                        "index change for unknown property '{}.{}'",
                        class, prop
                    )))
                })?;
                if matches!(change, SchemaChange::AddIndex(..)) {
                    table.add_search_index(col)?;
                } else {
                    table.remove_search_index(col)?;
                }
            }
            SchemaChange::RemoveProperty(class, prop) => {
                let table = txn
                    .get_table(&table_name_for_class(class))?
                    .expect("existing class");
                if let Some(col) = table.column_key(prop)? {
                    table.remove_column(col)?;
                }
            }
            SchemaChange::RemoveClass(_) => {}
        }
    }

    for change in changes {
        if let SchemaChange::RemoveClass(class) = change {
            txn.remove_table(&table_name_for_class(class))?;
        }
    }
    Ok(())
}

pub fn get_schema_version(txn: &Transaction) -> Result<u64> {
    let Some(table) = txn.get_table(METADATA_TABLE)? else {
        return Ok(NOT_VERSIONED);
    };
    let Some(col) = table.column_key(VERSION_COLUMN)? else {
        return Ok(NOT_VERSIONED);
    };
    let Some(key) = table.object_keys()?.first().copied() else {
        return Ok(NOT_VERSIONED);
    };
    match table.get_object(key)?.get(col)? {
        Value::Int(v) => Ok(v as u64),
        _ => Ok(NOT_VERSIONED),
    }
}

pub fn set_schema_version(txn: &Transaction, version: u64) -> Result<()> {
    let table = txn.get_or_add_table(METADATA_TABLE)?;
    let col = match table.column_key(VERSION_COLUMN)? {
        Some(col) => col,
        None => table.add_column(VERSION_COLUMN, ColumnType::Int, false)?,
    };
    let obj = match table.object_keys()?.first().copied() {
        Some(key) => table.get_object(key)?,
        None => table.create_object()?,
    };
    obj.set(col, Value::Int(version as i64))
}

/// Full desired-state reconciliation used by the realm façade: validates,
/// diffs against the persisted schema, checks the mode, applies.
pub fn migrate_schema(
    txn: &Transaction,
    desired: &Schema,
    mode: SchemaMode,
) -> Result<Vec<SchemaChange>> {
    desired.validate()?;
    let current = schema_from_transaction(txn)?;
    let changes = required_changes(&current, desired);
    check_mode_allows(mode, &changes)?;
    if !changes.is_empty() {
        apply_changes(txn, desired, &changes)?;
    }
    Ok(changes)
}
