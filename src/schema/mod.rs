//! # Schema
//!
//! The object-level schema model: classes with typed properties, mapped
//! onto tables and columns. Object tables are stored under decorated names
//! (`class_<name>`); system tables (metadata, and the backlink columns
//! inside object tables) never appear in a schema.
//!
//! A schema read back from a file reproduces the column keys and types of
//! the schema that produced it, so bindings can cache column indices
//! against a schema version.

pub mod migration;

use eyre::Result;

use crate::db::transaction::Transaction;
use crate::error::{err, ErrorKind};
use crate::table::spec::{
    ColumnType, ATTR_INDEXED, ATTR_LIST, ATTR_NULLABLE, ATTR_PRIMARY, ATTR_STRONG_LINKS,
};
use crate::value::ColKey;

/// Sentinel for "no schema version has been set".
pub const NOT_VERSIONED: u64 = u64::MAX;

const CLASS_PREFIX: &str = "class_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub ty: ColumnType,
    /// Target class name for link properties.
    pub object_type: Option<String>,
    pub optional: bool,
    pub indexed: bool,
    pub primary: bool,
    pub list: bool,
    /// Column key in the open file; populated when a schema is read back.
    pub table_column: Option<ColKey>,
}

impl Property {
    pub fn int(name: &str) -> Self {
        Self::new(name, ColumnType::Int)
    }

    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            object_type: None,
            optional: false,
            indexed: false,
            primary: false,
            list: false,
            table_column: None,
        }
    }

    pub fn attrs(&self) -> u8 {
        let mut attrs = 0;
        if self.optional {
            attrs |= ATTR_NULLABLE;
        }
        if self.indexed || self.primary {
            attrs |= ATTR_INDEXED;
        }
        if self.primary {
            attrs |= ATTR_PRIMARY;
        }
        if self.list {
            attrs |= ATTR_LIST;
        }
        attrs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSchema {
    pub name: String,
    pub embedded: bool,
    pub properties: Vec<Property>,
}

impl ObjectSchema {
    pub fn new(name: &str, properties: Vec<Property>) -> Self {
        Self {
            name: name.to_owned(),
            embedded: false,
            properties,
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn primary_key(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.primary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    objects: Vec<ObjectSchema>,
}

impl Schema {
    pub fn new(mut objects: Vec<ObjectSchema>) -> Self {
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Self { objects }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&ObjectSchema> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectSchema> {
        self.objects.iter()
    }

    /// Structural validation independent of any file.
    pub fn validate(&self) -> Result<()> {
        for object in &self.objects {
            let mut seen = Vec::new();
            let mut primaries = 0;
            for p in &object.properties {
                if seen.contains(&&p.name) {
                    return Err(err(ErrorKind::SchemaValidation(format!(
                        "duplicate property '{}' in class '{}'",
                        p.name, object.name
                    ))));
                }
                seen.push(&p.name);
                if p.primary {
                    primaries += 1;
                    if p.list {
                        return Err(err(ErrorKind::SchemaValidation(format!(
                            "primary key '{}' of class '{}' cannot be a list",
                            p.name, object.name
                        ))));
                    }
                    if !matches!(
                        p.ty,
                        ColumnType::Int
                            | ColumnType::String
                            | ColumnType::ObjectId
                            | ColumnType::Uuid
                    ) {
                        return Err(err(ErrorKind::SchemaValidation(format!(
                            "property '{}' of class '{}' cannot be a primary key",
                            p.name, object.name
                        ))));
                    }
                }
                if p.ty == ColumnType::Link {
                    let target = p.object_type.as_deref().ok_or_else(|| {
                        err(ErrorKind::SchemaValidation(format!(
                            "link property '{}' of class '{}' names no target",
                            p.name, object.name
                        )))
                    })?;
                    if self.find(target).is_none() {
                        return Err(err(ErrorKind::SchemaValidation(format!(
                            "link property '{}' of class '{}' targets unknown class '{}'",
                            p.name, object.name, target
                        ))));
                    }
                } else if p.object_type.is_some() {
                    return Err(err(ErrorKind::SchemaValidation(format!(
                        "property '{}' of class '{}' is not a link but names a target",
                        p.name, object.name
                    ))));
                }
            }
            if primaries > 1 {
                return Err(err(ErrorKind::SchemaValidation(format!(
                    "class '{}' has multiple primary keys",
                    object.name
                ))));
            }
            if object.embedded && object.primary_key().is_some() {
                return Err(err(ErrorKind::SchemaValidation(format!(
                    "embedded class '{}' cannot have a primary key",
                    object.name
                ))));
            }
        }
        Ok(())
    }
}

pub fn table_name_for_class(class: &str) -> String {
    format!("{}{}", CLASS_PREFIX, class)
}

pub fn class_for_table_name(table: &str) -> Option<&str> {
    table.strip_prefix(CLASS_PREFIX)
}

/// The attribute byte a property maps to, given the target's embeddedness
/// (links to embedded classes are strong).
pub fn column_attrs_for(property: &Property, target_embedded: bool) -> u8 {
    let mut attrs = property.attrs();
    if property.ty == ColumnType::Link && target_embedded {
        attrs |= ATTR_STRONG_LINKS;
    }
    attrs
}

/// Reads the schema persisted in the transaction's snapshot, including the
/// column key each property landed on.
pub fn schema_from_transaction(txn: &Transaction) -> Result<Schema> {
    let mut objects = Vec::new();
    for table_name in txn.table_names()? {
        let Some(class) = class_for_table_name(&table_name) else {
            continue;
        };
        let table = txn
            .get_table(&table_name)?
            .expect("table name came from the directory");
        let mut properties = Vec::new();
        for (col_key, col) in table.columns()? {
            let object_type = match col.peer_table {
                Some(target) => {
                    let target_name = txn.table(target)?.name()?;
                    class_for_table_name(&target_name).map(|c| c.to_owned())
                }
                None => None,
            };
            properties.push(Property {
                name: col.name.clone(),
                ty: col.ty,
                object_type,
                optional: col.is_nullable(),
                indexed: col.is_indexed(),
                primary: col.is_primary(),
                list: col.is_list(),
                table_column: Some(col_key),
            });
        }
        objects.push(ObjectSchema {
            name: class.to_owned(),
            embedded: table.is_embedded()?,
            properties,
        });
    }
    Ok(Schema::new(objects))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with(objects: Vec<ObjectSchema>) -> Schema {
        Schema::new(objects)
    }

    #[test]
    fn find_is_by_class_name() {
        let schema = schema_with(vec![
            ObjectSchema::new("b", vec![]),
            ObjectSchema::new("a", vec![Property::int("value")]),
        ]);
        assert_eq!(schema.len(), 2);
        assert!(schema.find("a").is_some());
        assert!(schema.find("missing").is_none());
    }

    #[test]
    fn duplicate_properties_fail_validation() {
        let schema = schema_with(vec![ObjectSchema::new(
            "a",
            vec![Property::int("x"), Property::int("x")],
        )]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn link_target_must_exist() {
        let mut link = Property::new("friend", ColumnType::Link);
        link.object_type = Some("nope".into());
        let schema = schema_with(vec![ObjectSchema::new("a", vec![link])]);
        let report = schema.validate().err().unwrap();
        assert!(matches!(
            crate::error::kind_of(&report),
            Some(ErrorKind::SchemaValidation(_))
        ));
    }

    #[test]
    fn multiple_primary_keys_fail() {
        let mut p1 = Property::int("a");
        p1.primary = true;
        let mut p2 = Property::int("b");
        p2.primary = true;
        let schema = schema_with(vec![ObjectSchema::new("o", vec![p1, p2])]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn binary_primary_key_fails() {
        let mut p = Property::new("pk", ColumnType::Binary);
        p.primary = true;
        let schema = schema_with(vec![ObjectSchema::new("o", vec![p])]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn table_name_decoration_roundtrips() {
        assert_eq!(table_name_for_class("person"), "class_person");
        assert_eq!(class_for_table_name("class_person"), Some("person"));
        assert_eq!(class_for_table_name("metadata"), None);
    }
}
