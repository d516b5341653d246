//! Schema reconciliation ("typing & deduping") engine.
//!
//! Diffs a stream's declared schema against the destination's physical
//! schema and applies the minimal set of changes, including lossless type
//! promotion and deferred destructive change-sets.

pub mod sync;

pub use sync::{
    ColumnChangeBehavior, PendingSchemaChanges, Reconciliation, SchemaDiff, SchemaSynchronizer,
    TableSchema, TypeChange,
};
