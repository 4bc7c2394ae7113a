//! # Error Kinds
//!
//! Every fallible operation in clusterdb returns `eyre::Result`. Failures
//! that callers need to dispatch on carry an [`ErrorKind`] as the root error
//! of the report, so a caller can recover the category with
//! `report.downcast_ref::<ErrorKind>()`.
//!
//! The kinds mirror the public failure surface of the engine:
//!
//! - configuration problems (`ConfigInvalid`, `ConfigMismatch`)
//! - schema problems (`SchemaValidation`, `Migration`)
//! - transaction misuse (`InvalidTransaction`, `IncorrectThread`, `Closed`)
//! - storage problems (`FileAccess`, `InvalidDatabase`)
//! - per-operation contract violations (`LogicError`)
//!
//! `Migration` is special: its display string is exactly the message produced
//! by the user migration callback, so the caller sees the original text.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("invalid transaction state: {0}")]
    InvalidTransaction(String),

    #[error("accessor used from incorrect execution context")]
    IncorrectThread,

    #[error("realm has been closed")]
    Closed,

    #[error("file access error: {0}")]
    FileAccess(String),

    #[error("invalid database: {0}")]
    InvalidDatabase(String),

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("{0}")]
    Migration(String),
}

/// Wraps a kind into a report. Call sites write `return Err(err(kind))` or
/// `Err(err(kind))?`.
pub fn err(kind: ErrorKind) -> eyre::Report {
    eyre::Report::new(kind)
}

/// Recovers the kind from a report produced by this crate, if any.
pub fn kind_of(report: &eyre::Report) -> Option<&ErrorKind> {
    report.downcast_ref::<ErrorKind>()
}
