//! Destination backend execution interface.
//!
//! The engine never emits backend-specific syntax. Everything reaches the
//! destination through two seams:
//!
//! - [`Backend`] — table-level operations and opaque statement execution
//! - [`StatementGenerator`] — builds the opaque [`Statement`]s (DDL,
//!   typed-commit variants) and supplies the retryability predicate
//!
//! [`InMemoryBackend`] and [`InMemoryStatementGenerator`] provide a
//! complete in-memory pair for testing and development; the generator
//! encodes a small operation descriptor into the statement text and the
//! backend interprets it, including cast simulation for the typed-commit
//! safe path.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{reserved, ColumnNameMapping, TableName};
use crate::error::BackendError;
use crate::message::{ChangeKind, ChangeReason, RecordChange, RecordMeta, StreamDescriptor};
use crate::types::{FieldSchema, FieldType, ObjectSchema};

/// An opaque, backend-specific statement built by a [`StatementGenerator`].
#[derive(Debug, Clone)]
pub struct Statement {
    /// Human-readable summary for logs.
    pub description: String,
    /// Backend-specific statement text.
    pub text: String,
}

/// Which typed-commit variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Fast path: any cast failure fails the whole statement.
    Unsafe,
    /// Safe path: per-value cast failures null the value and record the
    /// reason in row-level metadata; the row is still written.
    Safe,
}

/// Everything a backend needs to build one typed-commit statement.
#[derive(Debug, Clone, Copy)]
pub struct TypedCommitSpec<'a> {
    /// Raw landing table to read from.
    pub source: &'a TableName,
    /// Final table to write into.
    pub target: &'a TableName,
    /// Final-table schema in destination-column space.
    pub schema: &'a ObjectSchema,
    /// Declared-field → destination-column mapping.
    pub columns: &'a ColumnNameMapping,
    /// Identifier fields in destination-column space.
    pub primary_key: &'a [String],
    /// Whether to deduplicate by identifier fields, newest row winning.
    pub dedupe: bool,
    /// Process only raw rows whose loaded-at marker is still null. Set for
    /// incremental commits; cleared for full rebuilds, which must re-type
    /// the whole raw history.
    pub unloaded_only: bool,
    /// Exclude raw rows from generations below this bound.
    pub min_generation_id: Option<i64>,
    /// Statement variant.
    pub mode: CommitMode,
}

/// Builds opaque statements for one backend and classifies its failures.
pub trait StatementGenerator: Send + Sync {
    /// Adds a column to a table.
    fn add_column(&self, table: &TableName, column: &str, schema: &FieldSchema) -> Statement;

    /// Drops a column from a table.
    fn drop_column(&self, table: &TableName, column: &str) -> Statement;

    /// Changes a column's type in place.
    fn change_column_type(&self, table: &TableName, column: &str, schema: &FieldSchema)
        -> Statement;

    /// Relaxes a column to accept nulls.
    fn make_column_optional(&self, table: &TableName, column: &str) -> Statement;

    /// Replaces the table's declared identifier fields.
    fn set_identifier_fields(&self, table: &TableName, fields: &[String]) -> Statement;

    /// Builds the cast+dedup write from raw to final.
    fn typed_commit(&self, spec: &TypedCommitSpec<'_>) -> Statement;

    /// Returns `true` if re-running the safe typed-commit variant can
    /// absorb this failure. Only the backend knows its own error surface.
    fn is_retryable(&self, error: &BackendError) -> bool;
}

/// One raw record ready for the landing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Unique row identifier assigned at ingestion.
    pub raw_id: String,
    /// Source-side extraction timestamp, epoch milliseconds.
    pub extracted_at_ms: i64,
    /// Generation of the sync that produced the row.
    pub generation_id: i64,
    /// Near-verbatim record payload.
    pub data: Value,
    /// Row-level metadata.
    pub meta: RecordMeta,
}

/// Table-level view of the destination.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Executes an opaque statement built by the paired generator.
    async fn execute(&self, statement: &Statement) -> Result<(), BackendError>;

    /// Creates a table with the given schema. Succeeds without change if
    /// the table already exists.
    async fn create_table(
        &self,
        name: &TableName,
        schema: &ObjectSchema,
    ) -> Result<(), BackendError>;

    /// Drops a table. Succeeds without change if the table does not exist.
    async fn drop_table(&self, name: &TableName) -> Result<(), BackendError>;

    /// Appends every row of `source` to `target`, creating `target` with
    /// the source schema if missing.
    async fn copy_table(&self, source: &TableName, target: &TableName)
        -> Result<(), BackendError>;

    /// Upserts every row of `source` into `target` by identifier fields.
    async fn upsert_table(
        &self,
        source: &TableName,
        target: &TableName,
        primary_key: &[String],
    ) -> Result<(), BackendError>;

    /// Atomically replaces `target` with `source`, dropping `source`.
    async fn overwrite_table(
        &self,
        source: &TableName,
        target: &TableName,
    ) -> Result<(), BackendError>;

    /// Row count, or `None` if the table does not exist.
    async fn count_rows(&self, name: &TableName) -> Result<Option<u64>, BackendError>;

    /// Highest generation marker present in the table, or `None` if the
    /// table is missing or carries no generation column.
    async fn get_generation_id(&self, name: &TableName) -> Result<Option<i64>, BackendError>;

    /// Current physical schema, or `None` if the table does not exist.
    async fn table_schema(&self, name: &TableName) -> Result<Option<ObjectSchema>, BackendError>;

    /// Declared identifier fields, empty if none or table missing.
    async fn identifier_fields(&self, name: &TableName) -> Result<Vec<String>, BackendError>;

    /// Writes raw records into a landing table.
    async fn insert_records(
        &self,
        name: &TableName,
        rows: Vec<RawRecord>,
    ) -> Result<(), BackendError>;

    /// Reads the opaque persisted state blob for a stream.
    async fn read_destination_state(
        &self,
        stream: &StreamDescriptor,
    ) -> Result<Option<Value>, BackendError>;

    /// Writes the opaque persisted state blob for a stream.
    async fn write_destination_state(
        &self,
        stream: &StreamDescriptor,
        state: &Value,
    ) -> Result<(), BackendError>;
}

// ── In-memory implementation ───────────────────────────────────────

/// Operation descriptor the in-memory generator encodes into statement text.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum MemOp {
    AddColumn {
        table: TableName,
        column: String,
        schema: FieldSchema,
    },
    DropColumn {
        table: TableName,
        column: String,
    },
    ChangeColumnType {
        table: TableName,
        column: String,
        schema: FieldSchema,
    },
    MakeColumnOptional {
        table: TableName,
        column: String,
    },
    SetIdentifierFields {
        table: TableName,
        fields: Vec<String>,
    },
    TypedCommit {
        source: TableName,
        target: TableName,
        schema: ObjectSchema,
        columns: Vec<(String, String)>,
        primary_key: Vec<String>,
        dedupe: bool,
        unloaded_only: bool,
        min_generation_id: Option<i64>,
        mode: CommitMode,
    },
}

/// Statement generator paired with [`InMemoryBackend`].
///
/// Statements carry a JSON operation descriptor instead of SQL; a real
/// backend's generator would emit dialect text here.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatementGenerator;

impl InMemoryStatementGenerator {
    fn statement(description: impl Into<String>, op: &MemOp) -> Statement {
        Statement {
            description: description.into(),
            // Serializing a derive-only enum of plain data cannot fail.
            text: serde_json::to_string(op).unwrap_or_default(),
        }
    }
}

impl StatementGenerator for InMemoryStatementGenerator {
    fn add_column(&self, table: &TableName, column: &str, schema: &FieldSchema) -> Statement {
        Self::statement(
            format!("add column {column} to {table}"),
            &MemOp::AddColumn {
                table: table.clone(),
                column: column.to_string(),
                schema: schema.clone(),
            },
        )
    }

    fn drop_column(&self, table: &TableName, column: &str) -> Statement {
        Self::statement(
            format!("drop column {column} from {table}"),
            &MemOp::DropColumn {
                table: table.clone(),
                column: column.to_string(),
            },
        )
    }

    fn change_column_type(
        &self,
        table: &TableName,
        column: &str,
        schema: &FieldSchema,
    ) -> Statement {
        Self::statement(
            format!("change type of {column} on {table}"),
            &MemOp::ChangeColumnType {
                table: table.clone(),
                column: column.to_string(),
                schema: schema.clone(),
            },
        )
    }

    fn make_column_optional(&self, table: &TableName, column: &str) -> Statement {
        Self::statement(
            format!("make column {column} optional on {table}"),
            &MemOp::MakeColumnOptional {
                table: table.clone(),
                column: column.to_string(),
            },
        )
    }

    fn set_identifier_fields(&self, table: &TableName, fields: &[String]) -> Statement {
        Self::statement(
            format!("set identifier fields on {table}"),
            &MemOp::SetIdentifierFields {
                table: table.clone(),
                fields: fields.to_vec(),
            },
        )
    }

    fn typed_commit(&self, spec: &TypedCommitSpec<'_>) -> Statement {
        Self::statement(
            format!(
                "typed commit {} -> {} ({:?})",
                spec.source, spec.target, spec.mode
            ),
            &MemOp::TypedCommit {
                source: spec.source.clone(),
                target: spec.target.clone(),
                schema: spec.schema.clone(),
                columns: spec
                    .columns
                    .iter()
                    .map(|(f, c)| (f.to_string(), c.to_string()))
                    .collect(),
                primary_key: spec.primary_key.to_vec(),
                dedupe: spec.dedupe,
                unloaded_only: spec.unloaded_only,
                min_generation_id: spec.min_generation_id,
                mode: spec.mode,
            },
        )
    }

    fn is_retryable(&self, error: &BackendError) -> bool {
        matches!(error, BackendError::Statement { retryable: true, .. })
    }
}

#[derive(Debug, Default, Clone)]
struct MemTable {
    schema: ObjectSchema,
    identifier_fields: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Default)]
struct MemState {
    tables: HashMap<TableName, MemTable>,
    stream_states: HashMap<String, Value>,
}

/// In-memory destination for testing and development.
///
/// Stores tables as vectors of JSON rows and interprets the operation
/// descriptors produced by [`InMemoryStatementGenerator`], including the
/// unsafe/safe typed-commit cast semantics.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<MemState>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test accessor: rows of a table, or `None` if missing.
    #[must_use]
    pub fn rows(&self, name: &TableName) -> Option<Vec<Map<String, Value>>> {
        self.inner.lock().tables.get(name).map(|t| t.rows.clone())
    }

    /// Test accessor: whether a table exists.
    #[must_use]
    pub fn has_table(&self, name: &TableName) -> bool {
        self.inner.lock().tables.contains_key(name)
    }

    fn apply(&self, op: MemOp) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        match op {
            MemOp::AddColumn {
                table,
                column,
                schema,
            } => {
                let t = table_mut(&mut state, &table)?;
                t.schema.insert(column, schema);
                Ok(())
            }
            MemOp::DropColumn { table, column } => {
                let t = table_mut(&mut state, &table)?;
                t.schema.remove(&column);
                for row in &mut t.rows {
                    row.remove(&column);
                }
                Ok(())
            }
            MemOp::ChangeColumnType {
                table,
                column,
                schema,
            } => {
                let t = table_mut(&mut state, &table)?;
                t.schema.insert(column, schema);
                Ok(())
            }
            MemOp::MakeColumnOptional { table, column } => {
                let t = table_mut(&mut state, &table)?;
                if let Some(existing) = t.schema.get(&column).cloned() {
                    t.schema.insert(
                        column,
                        FieldSchema {
                            data_type: existing.data_type,
                            nullable: true,
                        },
                    );
                }
                Ok(())
            }
            MemOp::SetIdentifierFields { table, fields } => {
                let t = table_mut(&mut state, &table)?;
                t.identifier_fields = fields;
                Ok(())
            }
            MemOp::TypedCommit {
                source,
                target,
                schema,
                columns,
                primary_key,
                dedupe,
                unloaded_only,
                min_generation_id,
                mode,
            } => typed_commit(
                &mut state,
                &source,
                &target,
                &schema,
                &columns,
                &primary_key,
                dedupe,
                unloaded_only,
                min_generation_id,
                mode,
            ),
        }
    }
}

fn table_mut<'a>(
    state: &'a mut MemState,
    name: &TableName,
) -> Result<&'a mut MemTable, BackendError> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| BackendError::TableNotFound(name.to_string()))
}

#[allow(clippy::too_many_arguments)]
fn typed_commit(
    state: &mut MemState,
    source: &TableName,
    target: &TableName,
    schema: &ObjectSchema,
    columns: &[(String, String)],
    primary_key: &[String],
    dedupe: bool,
    unloaded_only: bool,
    min_generation_id: Option<i64>,
    mode: CommitMode,
) -> Result<(), BackendError> {
    let source_rows = state
        .tables
        .get(source)
        .ok_or_else(|| BackendError::TableNotFound(source.to_string()))?
        .rows
        .clone();

    let mut selected = Vec::new();
    let mut typed_rows = Vec::with_capacity(source_rows.len());
    for (index, raw_row) in source_rows.iter().enumerate() {
        if unloaded_only
            && raw_row
                .get(reserved::LOADED_AT)
                .is_some_and(|v| !v.is_null())
        {
            continue;
        }
        if let Some(bound) = min_generation_id {
            let generation = raw_row
                .get(reserved::GENERATION_ID)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if generation < bound {
                continue;
            }
        }
        let data = raw_row
            .get(reserved::DATA)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut meta: RecordMeta = raw_row
            .get(reserved::META)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let mut typed = Map::new();
        for (field, column) in columns {
            let Some(field_schema) = schema.get(column) else {
                continue;
            };
            let value = data.get(field).cloned().unwrap_or(Value::Null);
            match cast_value(&value, &field_schema.data_type) {
                Ok(cast) => {
                    typed.insert(column.clone(), cast);
                }
                Err(()) if mode == CommitMode::Unsafe => {
                    return Err(BackendError::Statement {
                        message: format!(
                            "cannot cast value of '{field}' to {:?}",
                            field_schema.data_type
                        ),
                        retryable: true,
                    });
                }
                Err(()) => {
                    typed.insert(column.clone(), Value::Null);
                    meta.changes.push(RecordChange {
                        field: field.clone(),
                        change: ChangeKind::Nulled,
                        reason: ChangeReason::DestinationTypecastError,
                    });
                }
            }
        }

        for key in [
            reserved::RAW_ID,
            reserved::EXTRACTED_AT,
            reserved::GENERATION_ID,
        ] {
            if let Some(v) = raw_row.get(key) {
                typed.insert(key.to_string(), v.clone());
            }
        }
        typed.insert(
            reserved::META.to_string(),
            serde_json::to_value(&meta).unwrap_or(Value::Null),
        );
        selected.push(index);
        typed_rows.push(typed);
    }

    if dedupe && !primary_key.is_empty() {
        typed_rows = dedupe_rows(typed_rows, primary_key);
    }

    let table = state.tables.entry(target.clone()).or_insert_with(|| MemTable {
        schema: schema.clone(),
        ..MemTable::default()
    });
    if dedupe && !primary_key.is_empty() {
        upsert_rows(&mut table.rows, typed_rows, primary_key);
    } else {
        table.rows.extend(typed_rows);
    }

    // High-water mark: every raw row this statement typed is stamped so a
    // later incremental commit does not re-process it.
    let loaded_at = epoch_ms();
    if let Some(src) = state.tables.get_mut(source) {
        for index in selected {
            if let Some(row) = src.rows.get_mut(index) {
                row.insert(reserved::LOADED_AT.to_string(), Value::from(loaded_at));
            }
        }
    }
    Ok(())
}

fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

fn pk_key(row: &Map<String, Value>, primary_key: &[String]) -> String {
    let values: Vec<String> = primary_key
        .iter()
        .map(|k| row.get(k).map_or_else(String::new, Value::to_string))
        .collect();
    values.join("\u{1f}")
}

fn extracted_at(row: &Map<String, Value>) -> i64 {
    row.get(reserved::EXTRACTED_AT)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Keeps the newest row per identifier, by extraction time then input order.
fn dedupe_rows(rows: Vec<Map<String, Value>>, primary_key: &[String]) -> Vec<Map<String, Value>> {
    let mut winners: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for row in rows {
        let key = pk_key(&row, primary_key);
        match winners.get(&key) {
            Some(existing) if extracted_at(existing) > extracted_at(&row) => {}
            Some(_) => {
                winners.insert(key, row);
            }
            None => {
                order.push(key.clone());
                winners.insert(key, row);
            }
        }
    }
    order.into_iter().filter_map(|k| winners.remove(&k)).collect()
}

fn upsert_rows(
    existing: &mut Vec<Map<String, Value>>,
    incoming: Vec<Map<String, Value>>,
    primary_key: &[String],
) {
    for row in incoming {
        let key = pk_key(&row, primary_key);
        if let Some(slot) = existing.iter_mut().find(|r| pk_key(r, primary_key) == key) {
            *slot = row;
        } else {
            existing.push(row);
        }
    }
}

/// Simulates a destination cast of one JSON value to a column type.
fn cast_value(value: &Value, data_type: &FieldType) -> Result<Value, ()> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match data_type {
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(()),
            },
            _ => Err(()),
        },
        FieldType::Integer | FieldType::Long => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .and_then(|f| serde_json::Number::from_f64(f))
                .map(Value::Number)
                .ok_or(()),
            Value::String(s) => s.parse::<i64>().map(Value::from).map_err(|_| ()),
            _ => Err(()),
        },
        FieldType::Float | FieldType::Double => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s.parse::<f64>().map(Value::from).map_err(|_| ()),
            _ => Err(()),
        },
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            // Non-string scalars and documents land as their JSON text.
            other => Ok(Value::String(other.to_string())),
        },
        FieldType::Date
        | FieldType::TimeWithTz
        | FieldType::TimeWithoutTz
        | FieldType::TimestampWithTz
        | FieldType::TimestampWithoutTz
        | FieldType::TimestampNanos
        | FieldType::Uuid
        | FieldType::Binary
        | FieldType::Fixed { .. }
        | FieldType::Decimal { .. } => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(()),
        },
        FieldType::Json => Ok(value.clone()),
        FieldType::Struct { .. } | FieldType::Map { .. } => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(()),
        },
        FieldType::Array { .. } => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(()),
        },
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn execute(&self, statement: &Statement) -> Result<(), BackendError> {
        let op: MemOp = serde_json::from_str(&statement.text).map_err(|e| {
            BackendError::Statement {
                message: format!("unparsable statement '{}': {e}", statement.description),
                retryable: false,
            }
        })?;
        self.apply(op)
    }

    async fn create_table(
        &self,
        name: &TableName,
        schema: &ObjectSchema,
    ) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        state.tables.entry(name.clone()).or_insert_with(|| MemTable {
            schema: schema.clone(),
            ..MemTable::default()
        });
        Ok(())
    }

    async fn drop_table(&self, name: &TableName) -> Result<(), BackendError> {
        self.inner.lock().tables.remove(name);
        Ok(())
    }

    async fn copy_table(
        &self,
        source: &TableName,
        target: &TableName,
    ) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        let src = state
            .tables
            .get(source)
            .ok_or_else(|| BackendError::TableNotFound(source.to_string()))?
            .clone();
        let dst = state.tables.entry(target.clone()).or_insert_with(|| MemTable {
            schema: src.schema.clone(),
            ..MemTable::default()
        });
        dst.rows.extend(src.rows);
        Ok(())
    }

    async fn upsert_table(
        &self,
        source: &TableName,
        target: &TableName,
        primary_key: &[String],
    ) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        let src = state
            .tables
            .get(source)
            .ok_or_else(|| BackendError::TableNotFound(source.to_string()))?
            .clone();
        let dst = state.tables.entry(target.clone()).or_insert_with(|| MemTable {
            schema: src.schema.clone(),
            ..MemTable::default()
        });
        upsert_rows(&mut dst.rows, src.rows, primary_key);
        Ok(())
    }

    async fn overwrite_table(
        &self,
        source: &TableName,
        target: &TableName,
    ) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        let src = state
            .tables
            .remove(source)
            .ok_or_else(|| BackendError::TableNotFound(source.to_string()))?;
        state.tables.insert(target.clone(), src);
        Ok(())
    }

    async fn count_rows(&self, name: &TableName) -> Result<Option<u64>, BackendError> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(name)
            .map(|t| t.rows.len() as u64))
    }

    async fn get_generation_id(&self, name: &TableName) -> Result<Option<i64>, BackendError> {
        Ok(self.inner.lock().tables.get(name).and_then(|t| {
            t.rows
                .iter()
                .filter_map(|r| r.get(reserved::GENERATION_ID).and_then(Value::as_i64))
                .max()
        }))
    }

    async fn table_schema(&self, name: &TableName) -> Result<Option<ObjectSchema>, BackendError> {
        Ok(self.inner.lock().tables.get(name).map(|t| t.schema.clone()))
    }

    async fn identifier_fields(&self, name: &TableName) -> Result<Vec<String>, BackendError> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(name)
            .map(|t| t.identifier_fields.clone())
            .unwrap_or_default())
    }

    async fn insert_records(
        &self,
        name: &TableName,
        rows: Vec<RawRecord>,
    ) -> Result<(), BackendError> {
        let mut state = self.inner.lock();
        let table = state
            .tables
            .get_mut(name)
            .ok_or_else(|| BackendError::TableNotFound(name.to_string()))?;
        for record in rows {
            let mut row = Map::new();
            row.insert(reserved::RAW_ID.to_string(), Value::String(record.raw_id));
            row.insert(
                reserved::EXTRACTED_AT.to_string(),
                Value::from(record.extracted_at_ms),
            );
            row.insert(
                reserved::META.to_string(),
                serde_json::to_value(&record.meta).unwrap_or(Value::Null),
            );
            row.insert(
                reserved::GENERATION_ID.to_string(),
                Value::from(record.generation_id),
            );
            row.insert(reserved::DATA.to_string(), record.data);
            row.insert(reserved::LOADED_AT.to_string(), Value::Null);
            table.rows.push(row);
        }
        Ok(())
    }

    async fn read_destination_state(
        &self,
        stream: &StreamDescriptor,
    ) -> Result<Option<Value>, BackendError> {
        Ok(self.inner.lock().stream_states.get(&stream.to_string()).cloned())
    }

    async fn write_destination_state(
        &self,
        stream: &StreamDescriptor,
        state: &Value,
    ) -> Result<(), BackendError> {
        self.inner
            .lock()
            .stream_states
            .insert(stream.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::raw_table_schema;

    fn raw(id: &str, extracted_at: i64, data: Value) -> RawRecord {
        RawRecord {
            raw_id: id.to_string(),
            extracted_at_ms: extracted_at,
            generation_id: 1,
            data,
            meta: RecordMeta::default(),
        }
    }

    fn users_schema() -> ObjectSchema {
        ObjectSchema::from_fields(vec![
            ("id".into(), FieldSchema::required(FieldType::Long)),
            ("email".into(), FieldSchema::optional(FieldType::String)),
        ])
    }

    fn identity_columns() -> ColumnNameMapping {
        // Build through the public catalog path to stay honest about the
        // mapping invariants.
        let generator = crate::catalog::DefaultColumnNameGenerator;
        let mut schema = ObjectSchema::new();
        schema.insert("id", FieldSchema::required(FieldType::Long));
        schema.insert("email", FieldSchema::optional(FieldType::String));
        let stream = crate::config::StreamConfig {
            descriptor: StreamDescriptor::new("public", "users"),
            schema,
            primary_key: vec!["id".into()],
            cursor: vec![],
            sync_mode: crate::config::SyncMode::Dedupe,
            generation_id: 1,
            min_generation_id: 0,
        };
        let catalog = crate::catalog::resolve_catalog(
            &crate::config::DestinationCatalog::new(vec![stream]),
            &crate::catalog::DefaultTableNameGenerator::default(),
            &generator,
        )
        .unwrap();
        catalog
            .entry(&StreamDescriptor::new("public", "users"))
            .unwrap()
            .columns
            .clone()
    }

    async fn seeded_backend(rows: Vec<RawRecord>) -> (InMemoryBackend, TableName, TableName) {
        let backend = InMemoryBackend::new();
        let source = TableName::new("internal", "raw_users");
        let target = TableName::new("public", "users");
        backend.create_table(&source, &raw_table_schema()).await.unwrap();
        backend.insert_records(&source, rows).await.unwrap();
        (backend, source, target)
    }

    fn commit_statement(
        source: &TableName,
        target: &TableName,
        schema: &ObjectSchema,
        columns: &ColumnNameMapping,
        dedupe: bool,
        mode: CommitMode,
    ) -> Statement {
        InMemoryStatementGenerator.typed_commit(&TypedCommitSpec {
            source,
            target,
            schema,
            columns,
            primary_key: &["id".to_string()],
            dedupe,
            unloaded_only: true,
            min_generation_id: None,
            mode,
        })
    }

    #[tokio::test]
    async fn test_unsafe_commit_fails_retryable_on_bad_value() {
        let (backend, source, target) = seeded_backend(vec![
            raw("r1", 1, serde_json::json!({"id": 1, "email": "a@b.c"})),
            raw("r2", 2, serde_json::json!({"id": "not-a-number", "email": "x@y.z"})),
        ])
        .await;

        let stmt = commit_statement(
            &source,
            &target,
            &users_schema(),
            &identity_columns(),
            false,
            CommitMode::Unsafe,
        );
        let err = backend.execute(&stmt).await.unwrap_err();
        assert!(InMemoryStatementGenerator.is_retryable(&err));
    }

    #[tokio::test]
    async fn test_safe_commit_nulls_bad_value_and_records_change() {
        let (backend, source, target) = seeded_backend(vec![
            raw("r1", 1, serde_json::json!({"id": 1, "email": "a@b.c"})),
            raw("r2", 2, serde_json::json!({"id": "not-a-number", "email": "x@y.z"})),
        ])
        .await;

        let stmt = commit_statement(
            &source,
            &target,
            &users_schema(),
            &identity_columns(),
            false,
            CommitMode::Safe,
        );
        backend.execute(&stmt).await.unwrap();

        let rows = backend.rows(&target).unwrap();
        assert_eq!(rows.len(), 2);
        let bad = rows
            .iter()
            .find(|r| r[reserved::RAW_ID] == "r2")
            .unwrap();
        assert!(bad["id"].is_null());
        let meta: RecordMeta = serde_json::from_value(bad[reserved::META].clone()).unwrap();
        assert_eq!(meta.changes.len(), 1);
        assert_eq!(meta.changes[0].field, "id");
        assert_eq!(meta.changes[0].change, ChangeKind::Nulled);
        assert_eq!(meta.changes[0].reason, ChangeReason::DestinationTypecastError);
    }

    #[tokio::test]
    async fn test_dedupe_keeps_newest_by_extraction_time() {
        let (backend, source, target) = seeded_backend(vec![
            raw("r1", 1, serde_json::json!({"id": 7, "email": "old@x.y"})),
            raw("r2", 9, serde_json::json!({"id": 7, "email": "new@x.y"})),
            raw("r3", 5, serde_json::json!({"id": 8, "email": "other@x.y"})),
        ])
        .await;

        let stmt = commit_statement(
            &source,
            &target,
            &users_schema(),
            &identity_columns(),
            true,
            CommitMode::Unsafe,
        );
        backend.execute(&stmt).await.unwrap();

        let rows = backend.rows(&target).unwrap();
        assert_eq!(rows.len(), 2);
        let seven = rows.iter().find(|r| r["id"] == 7).unwrap();
        assert_eq!(seven["email"], "new@x.y");
    }

    #[tokio::test]
    async fn test_typed_commit_stamps_rows_and_skips_them_next_time() {
        let (backend, source, target) = seeded_backend(vec![raw(
            "r1",
            1,
            serde_json::json!({"id": 1, "email": "a@b.c"}),
        )])
        .await;

        let stmt = commit_statement(
            &source,
            &target,
            &users_schema(),
            &identity_columns(),
            false,
            CommitMode::Unsafe,
        );
        backend.execute(&stmt).await.unwrap();

        let raw_rows = backend.rows(&source).unwrap();
        assert!(
            !raw_rows[0][reserved::LOADED_AT].is_null(),
            "committed raw rows carry a loaded-at stamp"
        );

        // A second run of the same statement finds nothing left to type.
        backend.execute(&stmt).await.unwrap();
        assert_eq!(backend.rows(&target).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_typed_commit_generation_bound_excludes_old_rows() {
        let (backend, source, target) = seeded_backend(vec![]).await;
        let mut old = raw("old", 1, serde_json::json!({"id": 1, "email": "old@x.y"}));
        old.generation_id = 0;
        let mut new = raw("new", 2, serde_json::json!({"id": 2, "email": "new@x.y"}));
        new.generation_id = 2;
        backend.insert_records(&source, vec![old, new]).await.unwrap();

        let stmt = InMemoryStatementGenerator.typed_commit(&TypedCommitSpec {
            source: &source,
            target: &target,
            schema: &users_schema(),
            columns: &identity_columns(),
            primary_key: &["id".to_string()],
            dedupe: false,
            unloaded_only: false,
            min_generation_id: Some(2),
            mode: CommitMode::Unsafe,
        });
        backend.execute(&stmt).await.unwrap();

        let rows = backend.rows(&target).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 2);
        // The excluded row keeps its null marker.
        let raw_rows = backend.rows(&source).unwrap();
        let old_row = raw_rows
            .iter()
            .find(|r| r[reserved::RAW_ID] == "old")
            .unwrap();
        assert!(old_row[reserved::LOADED_AT].is_null());
    }

    #[tokio::test]
    async fn test_overwrite_table_swaps_and_drops_source() {
        let backend = InMemoryBackend::new();
        let temp = TableName::new("public", "users_tmp");
        let target = TableName::new("public", "users");
        backend.create_table(&temp, &users_schema()).await.unwrap();
        backend.create_table(&target, &users_schema()).await.unwrap();

        backend.overwrite_table(&temp, &target).await.unwrap();
        assert!(!backend.has_table(&temp));
        assert!(backend.has_table(&target));
    }

    #[tokio::test]
    async fn test_count_rows_missing_table_is_none() {
        let backend = InMemoryBackend::new();
        let missing = TableName::new("public", "nope");
        assert_eq!(backend.count_rows(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generation_id_tracks_max() {
        let backend = InMemoryBackend::new();
        let table = TableName::new("internal", "raw_users");
        backend.create_table(&table, &raw_table_schema()).await.unwrap();
        let mut r1 = raw("r1", 1, serde_json::json!({"id": 1}));
        r1.generation_id = 3;
        let mut r2 = raw("r2", 2, serde_json::json!({"id": 2}));
        r2.generation_id = 5;
        backend.insert_records(&table, vec![r1, r2]).await.unwrap();
        assert_eq!(backend.get_generation_id(&table).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_destination_state_roundtrip() {
        let backend = InMemoryBackend::new();
        let stream = StreamDescriptor::new("public", "users");
        assert!(backend.read_destination_state(&stream).await.unwrap().is_none());
        backend
            .write_destination_state(&stream, &serde_json::json!({"needsSoftReset": true}))
            .await
            .unwrap();
        let state = backend.read_destination_state(&stream).await.unwrap().unwrap();
        assert_eq!(state["needsSoftReset"], true);
    }

    #[test]
    fn test_cast_value_string_absorbs_documents() {
        let doc = serde_json::json!({"a": 1});
        let cast = cast_value(&doc, &FieldType::String).unwrap();
        assert_eq!(cast, Value::String("{\"a\":1}".into()));
    }

    #[test]
    fn test_cast_value_rejects_mismatches() {
        assert!(cast_value(&serde_json::json!("abc"), &FieldType::Long).is_err());
        assert!(cast_value(&serde_json::json!(1.5), &FieldType::Long).is_err());
        assert!(cast_value(&serde_json::json!([1]), &FieldType::Struct { fields: vec![] }).is_err());
        assert!(cast_value(&serde_json::json!(12), &FieldType::Boolean).is_err());
    }
}
