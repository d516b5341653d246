//! Schema diffing and synchronization.
//!
//! [`SchemaSynchronizer::reconcile`] brings a destination table's physical
//! schema in line with the declared one, in a fixed order:
//!
//! 1. drop columns absent from the incoming schema
//! 2. resolve changed column types (supertype promotion or overwrite)
//! 3. relax newly-nullable columns
//! 4. add new columns, parents before children (one nesting level at most)
//! 5. update identifier-field declarations
//!
//! Supertype promotions commit immediately. Overwrite changes come back as
//! an uncommitted [`PendingSchemaChanges`] the owner must apply explicitly,
//! because dropping and re-adding columns may need batching with other
//! destructive operations.

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Statement, StatementGenerator};
use crate::catalog::TableName;
use crate::error::{LoadResult, SchemaError};
use crate::types::{find_super_type, nesting_depth, FieldSchema, ObjectSchema};

/// Behavior applied when a column's declared type changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnChangeBehavior {
    /// Promote to the narrowest lossless common type; fail the stream if
    /// none exists. Changes commit immediately.
    #[default]
    SafeSupertype,
    /// Unconditionally drop and re-add the column with the incoming type.
    /// Changes are returned uncommitted for the caller to apply.
    Overwrite,
}

/// A destination table's physical schema plus identifier declarations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    /// Columns in physical order.
    pub columns: ObjectSchema,
    /// Declared identifier (primary-key) fields.
    pub identifier_fields: Vec<String>,
}

/// One column whose type must change.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeChange {
    /// The destination column.
    pub column: String,
    /// Current physical schema of the column.
    pub existing: FieldSchema,
    /// Incoming declared schema of the column.
    pub incoming: FieldSchema,
    /// The schema the column will have after reconciliation.
    pub target: FieldSchema,
}

/// Ephemeral per-stream schema diff. Computed, applied, discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    /// Columns to drop, in physical order.
    pub removed: Vec<String>,
    /// Columns whose type must change.
    pub type_changes: Vec<TypeChange>,
    /// Columns that became nullable.
    pub newly_optional: Vec<String>,
    /// Columns to add, ascending nesting depth (parents before children).
    pub added: Vec<(String, FieldSchema)>,
    /// Whether the identifier-field declaration changed.
    pub identifier_fields_changed: bool,
}

impl SchemaDiff {
    /// Returns `true` if reconciliation would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.type_changes.is_empty()
            && self.newly_optional.is_empty()
            && self.added.is_empty()
            && !self.identifier_fields_changed
    }
}

/// Computes the diff between a physical and a declared schema.
///
/// A column counts as type-changed only when reconciliation would actually
/// alter it: under [`ColumnChangeBehavior::SafeSupertype`] that means the
/// supertype differs from the existing type, so a column already promoted
/// past the incoming type stays untouched and a second reconcile yields an
/// empty diff.
///
/// # Errors
///
/// Under `SafeSupertype`, returns a [`SchemaError`] when a changed pair has
/// no lossless promotion or involves a disallowed type.
pub fn diff_schemas(
    existing: &TableSchema,
    incoming: &TableSchema,
    behavior: ColumnChangeBehavior,
) -> Result<SchemaDiff, SchemaError> {
    let mut diff = SchemaDiff::default();

    for (column, _) in existing.columns.iter() {
        if !incoming.columns.contains(column) {
            diff.removed.push(column.to_string());
        }
    }

    for (column, incoming_schema) in incoming.columns.iter() {
        let Some(existing_schema) = existing.columns.get(column) else {
            continue;
        };
        if existing_schema.data_type != incoming_schema.data_type {
            let target = match behavior {
                ColumnChangeBehavior::SafeSupertype => {
                    let promoted =
                        find_super_type(&existing_schema.data_type, &incoming_schema.data_type)?;
                    FieldSchema {
                        data_type: promoted,
                        nullable: existing_schema.nullable,
                    }
                }
                ColumnChangeBehavior::Overwrite => incoming_schema.clone(),
            };
            if target.data_type != existing_schema.data_type {
                diff.type_changes.push(TypeChange {
                    column: column.to_string(),
                    existing: existing_schema.clone(),
                    incoming: incoming_schema.clone(),
                    target,
                });
            }
        }
        if incoming_schema.nullable && !existing_schema.nullable {
            diff.newly_optional.push(column.to_string());
        }
    }

    for (column, schema) in incoming.columns.iter() {
        if !existing.columns.contains(column) {
            diff.added.push((column.to_string(), schema.clone()));
        }
    }
    // Stable sort: parents (shallower types) first, declared order within
    // one depth.
    diff.added
        .sort_by_key(|(_, schema)| nesting_depth(&schema.data_type));

    diff.identifier_fields_changed = existing.identifier_fields != incoming.identifier_fields;

    Ok(diff)
}

/// Destructive schema changes awaiting an explicit commit.
///
/// Returned by [`SchemaSynchronizer::reconcile`] under
/// [`ColumnChangeBehavior::Overwrite`]; nothing has been executed yet and
/// the owner must call [`PendingSchemaChanges::apply`].
#[derive(Debug)]
#[must_use = "pending schema changes do nothing until apply() is called"]
pub struct PendingSchemaChanges {
    statements: Vec<Statement>,
}

impl PendingSchemaChanges {
    /// Number of statements awaiting execution.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Returns `true` if there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Executes the deferred statements in order.
    ///
    /// # Errors
    ///
    /// Propagates the first backend failure; remaining statements are not
    /// executed.
    pub async fn apply(self, backend: &dyn Backend) -> LoadResult<()> {
        for statement in &self.statements {
            tracing::debug!(statement = %statement.description, "applying deferred schema change");
            backend.execute(statement).await?;
        }
        Ok(())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug)]
pub struct Reconciliation {
    /// The schema the table has (or will have, once pending changes apply).
    pub schema: TableSchema,
    /// The diff that was applied.
    pub diff: SchemaDiff,
    /// Uncommitted destructive changes, present only under
    /// [`ColumnChangeBehavior::Overwrite`] when types changed.
    pub pending: Option<PendingSchemaChanges>,
}

/// Applies schema diffs to destination tables.
pub struct SchemaSynchronizer<'a> {
    backend: &'a dyn Backend,
    generator: &'a dyn StatementGenerator,
}

impl<'a> SchemaSynchronizer<'a> {
    /// Creates a synchronizer over a backend and its statement generator.
    #[must_use]
    pub fn new(backend: &'a dyn Backend, generator: &'a dyn StatementGenerator) -> Self {
        Self { backend, generator }
    }

    /// Reconciles one table's physical schema with the declared one.
    ///
    /// # Errors
    ///
    /// - [`SchemaError`] for unsupported promotions or nesting deeper than
    ///   one level — these abort the stream, not the sync
    /// - backend errors from immediately-committed statements
    pub async fn reconcile(
        &self,
        table: &TableName,
        existing: &TableSchema,
        incoming: &TableSchema,
        behavior: ColumnChangeBehavior,
    ) -> LoadResult<Reconciliation> {
        let diff = diff_schemas(existing, incoming, behavior)?;

        // Validate nesting before touching the destination, so a doomed
        // stream leaves no partial DDL behind.
        for (column, schema) in diff
            .added
            .iter()
            .map(|(c, s)| (c, s))
            .chain(diff.type_changes.iter().map(|tc| (&tc.column, &tc.target)))
        {
            let depth = nesting_depth(&schema.data_type);
            if depth > 1 {
                return Err(SchemaError::NestingTooDeep {
                    column: column.clone(),
                    depth,
                }
                .into());
            }
        }

        let mut schema = existing.clone();
        let mut deferred: Vec<Statement> = Vec::new();

        for column in &diff.removed {
            self.backend
                .execute(&self.generator.drop_column(table, column))
                .await?;
            schema.columns.remove(column);
        }

        for change in &diff.type_changes {
            match behavior {
                ColumnChangeBehavior::SafeSupertype => {
                    self.backend
                        .execute(&self.generator.change_column_type(
                            table,
                            &change.column,
                            &change.target,
                        ))
                        .await?;
                }
                ColumnChangeBehavior::Overwrite => {
                    deferred.push(self.generator.drop_column(table, &change.column));
                    deferred.push(self.generator.add_column(table, &change.column, &change.target));
                }
            }
            schema.columns.insert(change.column.clone(), change.target.clone());
        }

        for column in &diff.newly_optional {
            self.backend
                .execute(&self.generator.make_column_optional(table, column))
                .await?;
            if let Some(existing_schema) = schema.columns.get(column).cloned() {
                schema.columns.insert(
                    column.clone(),
                    FieldSchema {
                        data_type: existing_schema.data_type,
                        nullable: true,
                    },
                );
            }
        }

        for (column, field_schema) in &diff.added {
            self.backend
                .execute(&self.generator.add_column(table, column, field_schema))
                .await?;
            schema.columns.insert(column.clone(), field_schema.clone());
        }

        if diff.identifier_fields_changed {
            self.backend
                .execute(
                    &self
                        .generator
                        .set_identifier_fields(table, &incoming.identifier_fields),
                )
                .await?;
            schema.identifier_fields = incoming.identifier_fields.clone();
        }

        if !diff.is_empty() {
            tracing::info!(
                table = %table,
                removed = diff.removed.len(),
                type_changes = diff.type_changes.len(),
                added = diff.added.len(),
                deferred = deferred.len(),
                "schema reconciled"
            );
        }

        let pending = if deferred.is_empty() {
            None
        } else {
            Some(PendingSchemaChanges {
                statements: deferred,
            })
        };
        Ok(Reconciliation {
            schema,
            diff,
            pending,
        })
    }
}
