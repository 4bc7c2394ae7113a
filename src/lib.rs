//! # clusterdb - Embedded Transactional Object Database
//!
//! clusterdb stores structured object graphs in a single file, provides
//! ACID write transactions with multi-version concurrency control, and
//! records every mutation as a changeset for bidirectional sync with a
//! remote server. It is the storage and transaction core consumed by
//! host-language bindings and a sync client.
//!
//! ## Quick Start
//!
//! ```ignore
//! use clusterdb::{Realm, RealmConfig, Schema, ObjectSchema, Property, Value};
//!
//! let config = RealmConfig {
//!     path: Some("objects.cdb".into()),
//!     schema_version: Some(1),
//!     schema: Some(Schema::new(vec![ObjectSchema::new(
//!         "person",
//!         vec![Property::int("age")],
//!     )])),
//!     ..Default::default()
//! };
//! let realm = Realm::open(config)?;
//! realm.write(|txn| {
//!     let table = txn.get_table("class_person")?.unwrap();
//!     let age = table.column_key("age")?.unwrap();
//!     table.create_object()?.set(age, Value::Int(29))
//! })?;
//! ```
//!
//! ## Architecture
//!
//! The engine is a stack of layers, leaves first:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │     Realm (config, schema, cache)    │
//! ├─────────────────────────────────────┤
//! │  Schema Migrator │ Replication/Hist. │
//! ├──────────────────┴──────────────────┤
//! │   Shared Group (MVCC, transactions)  │
//! ├─────────────────────────────────────┤
//! │   Group / Table / Cluster Tree       │
//! ├─────────────────────────────────────┤
//! │   B+Tree │ Array Nodes               │
//! ├─────────────────────────────────────┤
//! │   Slab Allocator / File Map          │
//! └─────────────────────────────────────┘
//! ```
//!
//! Mutation is copy-on-write throughout: a write transaction builds new
//! nodes in its own slabs and publishes them with one header flip, so every
//! committed version is immutable and readers never block.
//!
//! ## Module Overview
//!
//! - [`alloc`]: file mapping, slab allocation, version-tagged free list
//! - [`array`]: bit-packed and variable-sized array nodes
//! - [`bptree`]: generic B+tree over array nodes
//! - [`cluster`]: column-major object storage keyed by object key
//! - [`table`]: spec, objects, links/backlinks, lists, search index
//! - [`group`]: the on-disk root and table directory
//! - [`db`]: shared group, version ring, transactions
//! - [`repl`]: changeset recording, history, application
//! - [`schema`]: object schema model and migrations
//! - [`realm`]: the configuration-driven façade
//! - [`crypto`]: optional at-rest encryption

pub mod alloc;
pub mod array;
pub mod bptree;
pub mod cluster;
pub mod crypto;
pub mod db;
pub mod encoding;
pub mod error;
pub mod group;
pub mod node;
pub mod realm;
pub mod repl;
pub mod schema;
pub mod table;
pub mod value;

pub use db::transaction::{Lst, Obj, Table, Transaction};
pub use db::{DbOptions, DB};
pub use error::{kind_of, ErrorKind};
pub use realm::{BindingContext, MigrationFunction, Realm, RealmConfig};
pub use schema::migration::SchemaMode;
pub use schema::{ObjectSchema, Property, Schema, NOT_VERSIONED};
pub use table::spec::ColumnType;
pub use value::{ColKey, Decimal128, ObjKey, ObjectId, TableKey, Timestamp, Uuid, Value};
