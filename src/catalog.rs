//! Table and column naming catalog.
//!
//! Maps the logical stream catalog onto physical destination identifiers:
//!
//! - [`TableNameGenerator`] / [`ColumnNameGenerator`] — per-backend naming,
//!   injected by the connector
//! - [`resolve_catalog`] — computes every stream's raw/final table names in
//!   catalog-declared order, disambiguating collisions with a content-hash
//!   suffix
//! - [`ColumnNameMapping`] — the invertible declared-field → destination
//!   column map
//!
//! Everything produced here is computed once per sync and read-only
//! afterwards.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{DestinationCatalog, StreamConfig};
use crate::error::{ConfigError, LoadResult};
use crate::message::StreamDescriptor;
use crate::types::{FieldSchema, FieldType, ObjectSchema};

/// Reserved destination column names present on every raw and final table.
pub mod reserved {
    /// Unique row identifier assigned at ingestion.
    pub const RAW_ID: &str = "_airbyte_raw_id";
    /// Source-side extraction timestamp.
    pub const EXTRACTED_AT: &str = "_airbyte_extracted_at";
    /// Row-level metadata, including per-value change records.
    pub const META: &str = "_airbyte_meta";
    /// Generation marker distinguishing refresh cycles.
    pub const GENERATION_ID: &str = "_airbyte_generation_id";
    /// Near-verbatim record payload, raw tables only.
    pub const DATA: &str = "_airbyte_data";
    /// When the row was typed into the final table; null until committed.
    /// Raw tables only. The typed commit's high-water marker.
    pub const LOADED_AT: &str = "_airbyte_loaded_at";
}

/// A physical `(namespace, name)` table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// Destination namespace (schema, dataset, ...).
    pub namespace: String,
    /// Table name within the namespace.
    pub name: String,
}

impl TableName {
    /// Creates a table name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// The physical tables assigned to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Intermediate landing table for near-verbatim records. Absent for
    /// backends that load the final table directly.
    pub raw: Option<TableName>,
    /// Typed, deduplicated, user-facing table.
    pub final_table: TableName,
}

/// Generates candidate physical table names for a stream.
///
/// One implementation per backend; the engine only consumes the results.
pub trait TableNameGenerator: Send + Sync {
    /// Candidate raw table name, or `None` for direct-load backends.
    fn raw_table_name(&self, stream: &StreamDescriptor) -> Option<TableName>;

    /// Candidate final table name.
    fn final_table_name(&self, stream: &StreamDescriptor) -> TableName;
}

/// A generated destination column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnName {
    /// The name used in DDL and projections.
    pub display: String,
    /// The name used for collision comparison. Backends that fold case or
    /// strip characters return the folded form here.
    pub canonical: String,
}

/// Generates destination-safe column names for declared fields.
pub trait ColumnNameGenerator: Send + Sync {
    /// Maps one declared field name to a destination column name.
    fn column_name(&self, field: &str) -> ColumnName;
}

/// Bijective declared-field → destination-column mapping for one stream.
///
/// Invariant: always invertible. Construction fails if two fields collide
/// on their canonical names or on their display names, so every produced
/// key recovers its original field via
/// [`ColumnNameMapping::original_name`].
#[derive(Debug, Clone, Default)]
pub struct ColumnNameMapping {
    entries: Vec<(String, String)>,
    reverse: HashMap<String, String>,
}

impl ColumnNameMapping {
    /// Returns the destination column for a declared field.
    #[must_use]
    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, c)| c.as_str())
    }

    /// Returns the declared field behind a destination column.
    #[must_use]
    pub fn original_name(&self, column: &str) -> Option<&str> {
        self.reverse.get(column).map(String::as_str)
    }

    /// Iterates `(field, column)` pairs in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(f, c)| (f.as_str(), c.as_str()))
    }

    /// Number of mapped fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no fields are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved physical identity of one stream.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Assigned raw/final table names.
    pub table_names: TableNames,
    /// Field-to-column mapping.
    pub columns: ColumnNameMapping,
}

impl CatalogEntry {
    /// Projects a stream's declared schema into destination-column space,
    /// preserving declared order.
    #[must_use]
    pub fn destination_schema(&self, stream: &StreamConfig) -> ObjectSchema {
        let mut out = ObjectSchema::new();
        for (field, schema) in stream.schema.iter() {
            if let Some(column) = self.columns.column_for(field) {
                out.insert(column, schema.clone());
            }
        }
        out
    }

    /// Maps the stream's identifier fields into destination-column space,
    /// dropping any field the mapping does not know.
    #[must_use]
    pub fn destination_primary_key(&self, stream: &StreamConfig) -> Vec<String> {
        stream
            .primary_key
            .iter()
            .filter_map(|f| self.columns.column_for(f).map(str::to_string))
            .collect()
    }
}

/// Immutable stream → physical identity map for one sync.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    entries: HashMap<StreamDescriptor, CatalogEntry>,
}

impl TableCatalog {
    /// Looks up a stream's resolved entry.
    #[must_use]
    pub fn entry(&self, stream: &StreamDescriptor) -> Option<&CatalogEntry> {
        self.entries.get(stream)
    }

    /// Looks up a stream's assigned table names.
    #[must_use]
    pub fn table_names(&self, stream: &StreamDescriptor) -> Option<&TableNames> {
        self.entries.get(stream).map(|e| &e.table_names)
    }

    /// Number of resolved streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no streams were resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates resolved entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamDescriptor, &CatalogEntry)> {
        self.entries.iter()
    }
}

/// First 3 hex characters of the SHA-256 of `"{namespace}&airbyte&{name}"`.
///
/// Three characters bound the safe catalog size before birthday-collision
/// risk becomes non-negligible, and no second-order re-check runs after
/// disambiguation. Known limitation, kept deliberately.
#[must_use]
pub fn collision_hash(stream: &StreamDescriptor) -> String {
    let namespace = stream.namespace.as_deref().unwrap_or_default();
    let digest = Sha256::digest(format!("{namespace}&airbyte&{}", stream.name));
    let hex = format!("{digest:x}");
    hex[..3].to_string()
}

/// Resolves the whole catalog into physical table identities.
///
/// Streams are processed in catalog-declared order. Two assigned-name sets
/// (raw, final) are tracked, scoped to this call; when a candidate collides
/// with an already-assigned name, the stream's logical name is suffixed
/// with `_{hash}` (see [`collision_hash`]) and both table names are
/// regenerated from the disambiguated logical name.
///
/// # Errors
///
/// - [`ConfigError::EmptyCatalog`] if no streams are declared
/// - [`ConfigError::ColumnCollision`] if two fields of one stream
///   canonicalize to the same column (an upstream precondition, surfaced
///   here as fail-fast)
pub fn resolve_catalog(
    catalog: &DestinationCatalog,
    tables: &dyn TableNameGenerator,
    columns: &dyn ColumnNameGenerator,
) -> LoadResult<TableCatalog> {
    if catalog.streams.is_empty() {
        return Err(ConfigError::EmptyCatalog.into());
    }

    // Collision-tracking sets live exactly as long as this call.
    let mut assigned_raw: HashSet<TableName> = HashSet::new();
    let mut assigned_final: HashSet<TableName> = HashSet::new();
    let mut entries = HashMap::with_capacity(catalog.streams.len());

    for stream in &catalog.streams {
        let descriptor = &stream.descriptor;
        let mut names = TableNames {
            raw: tables.raw_table_name(descriptor),
            final_table: tables.final_table_name(descriptor),
        };

        let collides = assigned_final.contains(&names.final_table)
            || names.raw.as_ref().is_some_and(|r| assigned_raw.contains(r));
        if collides {
            let suffix = collision_hash(descriptor);
            let disambiguated = StreamDescriptor {
                namespace: descriptor.namespace.clone(),
                name: format!("{}_{suffix}", descriptor.name),
            };
            tracing::info!(
                stream = %descriptor,
                disambiguated = %disambiguated,
                "table name collision, regenerating from suffixed logical name"
            );
            names = TableNames {
                raw: tables.raw_table_name(&disambiguated),
                final_table: tables.final_table_name(&disambiguated),
            };
        }

        if let Some(raw) = &names.raw {
            assigned_raw.insert(raw.clone());
        }
        assigned_final.insert(names.final_table.clone());

        let mapping = build_column_mapping(stream, columns)?;
        entries.insert(
            descriptor.clone(),
            CatalogEntry {
                table_names: names,
                columns: mapping,
            },
        );
    }

    Ok(TableCatalog { entries })
}

fn build_column_mapping(
    stream: &StreamConfig,
    columns: &dyn ColumnNameGenerator,
) -> LoadResult<ColumnNameMapping> {
    let mut entries = Vec::with_capacity(stream.schema.len());
    let mut reverse: HashMap<String, String> = HashMap::with_capacity(stream.schema.len());
    let mut canonical_owner: HashMap<String, String> = HashMap::new();

    for (field, _) in stream.schema.iter() {
        let name = columns.column_name(field);
        if let Some(prior) = canonical_owner.get(&name.canonical) {
            return Err(ConfigError::ColumnCollision {
                stream: stream.descriptor.to_string(),
                field: prior.clone(),
                other: field.to_string(),
                canonical: name.canonical,
            }
            .into());
        }
        canonical_owner.insert(name.canonical, field.to_string());
        // Duplicate display names break the reverse lookup even when the
        // canonical forms differ; reject them the same way.
        if let Some(prior) = reverse.get(&name.display) {
            return Err(ConfigError::ColumnCollision {
                stream: stream.descriptor.to_string(),
                field: prior.clone(),
                other: field.to_string(),
                canonical: name.display,
            }
            .into());
        }
        reverse.insert(name.display.clone(), field.to_string());
        entries.push((field.to_string(), name.display));
    }

    Ok(ColumnNameMapping { entries, reverse })
}

// ── Default generators ─────────────────────────────────────────────

/// Replaces characters a typical destination rejects with underscores.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Default table naming: final tables keep the stream's namespace (or a
/// configured fallback); raw tables land together in one internal
/// namespace under `{namespace}_raw__stream_{name}`.
#[derive(Debug, Clone)]
pub struct DefaultTableNameGenerator {
    /// Namespace used when the stream declares none.
    pub default_namespace: String,
    /// Namespace holding every raw table, or `None` for direct-load mode
    /// (no raw tables at all).
    pub raw_namespace: Option<String>,
}

impl Default for DefaultTableNameGenerator {
    fn default() -> Self {
        Self {
            default_namespace: "public".to_string(),
            raw_namespace: Some("airbyte_internal".to_string()),
        }
    }
}

impl DefaultTableNameGenerator {
    fn effective_namespace(&self, stream: &StreamDescriptor) -> String {
        stream
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone())
    }
}

impl TableNameGenerator for DefaultTableNameGenerator {
    fn raw_table_name(&self, stream: &StreamDescriptor) -> Option<TableName> {
        let raw_namespace = self.raw_namespace.clone()?;
        let namespace = self.effective_namespace(stream);
        Some(TableName::new(
            raw_namespace,
            sanitize_identifier(&format!("{namespace}_raw__stream_{}", stream.name)),
        ))
    }

    fn final_table_name(&self, stream: &StreamDescriptor) -> TableName {
        TableName::new(
            sanitize_identifier(&self.effective_namespace(stream)),
            sanitize_identifier(&stream.name),
        )
    }
}

/// Default column naming: sanitized display name, lowercased canonical name.
#[derive(Debug, Clone, Default)]
pub struct DefaultColumnNameGenerator;

impl ColumnNameGenerator for DefaultColumnNameGenerator {
    fn column_name(&self, field: &str) -> ColumnName {
        let display = sanitize_identifier(field);
        ColumnName {
            canonical: display.to_ascii_lowercase(),
            display,
        }
    }
}

/// The fixed schema of every raw landing table.
#[must_use]
pub fn raw_table_schema() -> ObjectSchema {
    ObjectSchema::from_fields(vec![
        (
            reserved::RAW_ID.to_string(),
            FieldSchema::required(FieldType::String),
        ),
        (
            reserved::EXTRACTED_AT.to_string(),
            FieldSchema::required(FieldType::TimestampWithTz),
        ),
        (
            reserved::META.to_string(),
            FieldSchema::required(FieldType::Json),
        ),
        (
            reserved::GENERATION_ID.to_string(),
            FieldSchema::optional(FieldType::Long),
        ),
        (
            reserved::DATA.to_string(),
            FieldSchema::required(FieldType::Json),
        ),
        (
            reserved::LOADED_AT.to_string(),
            FieldSchema::optional(FieldType::TimestampWithTz),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;

    fn stream(namespace: &str, name: &str, fields: &[&str]) -> StreamConfig {
        let mut schema = ObjectSchema::new();
        for f in fields {
            schema.insert(*f, FieldSchema::optional(FieldType::String));
        }
        StreamConfig {
            descriptor: StreamDescriptor::new(namespace, name),
            schema,
            primary_key: vec![],
            cursor: vec![],
            sync_mode: SyncMode::Append,
            generation_id: 0,
            min_generation_id: 0,
        }
    }

    fn resolve(streams: Vec<StreamConfig>) -> TableCatalog {
        resolve_catalog(
            &DestinationCatalog::new(streams),
            &DefaultTableNameGenerator::default(),
            &DefaultColumnNameGenerator,
        )
        .unwrap()
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("My-Table"), "My_Table");
        assert_eq!(sanitize_identifier("My_Table"), "My_Table");
        assert_eq!(sanitize_identifier("9lives"), "_9lives");
        assert_eq!(sanitize_identifier("émoji✨"), "______");
        assert_eq!(sanitize_identifier(""), "_");
    }

    #[test]
    fn test_collision_hash_is_three_hex_chars() {
        let h = collision_hash(&StreamDescriptor::new("public", "My_Table"));
        assert_eq!(h.len(), 3);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(
            h,
            collision_hash(&StreamDescriptor::new("public", "My_Table"))
        );
        // Sensitive to both namespace and name.
        assert_ne!(
            collision_hash(&StreamDescriptor::new("a", "t")),
            collision_hash(&StreamDescriptor::new("b", "t"))
        );
    }

    #[test]
    fn test_sanitize_collision_gets_hash_suffix() {
        // Both sanitize to "My_Table"; declared order decides who keeps
        // the clean name.
        let catalog = resolve(vec![
            stream("public", "My-Table", &["id"]),
            stream("public", "My_Table", &["id"]),
        ]);

        let first = catalog
            .table_names(&StreamDescriptor::new("public", "My-Table"))
            .unwrap();
        let second = catalog
            .table_names(&StreamDescriptor::new("public", "My_Table"))
            .unwrap();

        assert_eq!(first.final_table.name, "My_Table");
        let expected = format!(
            "My_Table_{}",
            collision_hash(&StreamDescriptor::new("public", "My_Table"))
        );
        assert_eq!(second.final_table.name, expected);
        assert_ne!(first.final_table, second.final_table);
        assert_ne!(first.raw, second.raw);
    }

    #[test]
    fn test_all_names_pairwise_distinct() {
        // Several streams that all sanitize to the same identifier.
        let catalog = resolve(vec![
            stream("public", "events", &["id"]),
            stream("public", "Events!", &["id"]),
            stream("other", "orders", &["id"]),
            stream("other", "users", &["id"]),
        ]);

        let finals: HashSet<_> = catalog
            .iter()
            .map(|(_, e)| e.table_names.final_table.clone())
            .collect();
        let raws: HashSet<_> = catalog
            .iter()
            .filter_map(|(_, e)| e.table_names.raw.clone())
            .collect();
        assert_eq!(finals.len(), 4);
        assert_eq!(raws.len(), 4);
    }

    #[test]
    fn test_column_mapping_invertible() {
        let catalog = resolve(vec![stream(
            "public",
            "users",
            &["id", "first-name", "Last Name"],
        )]);
        let entry = catalog
            .entry(&StreamDescriptor::new("public", "users"))
            .unwrap();

        for (field, column) in entry.columns.iter() {
            assert_eq!(entry.columns.original_name(column), Some(field));
        }
        assert_eq!(entry.columns.column_for("first-name"), Some("first_name"));
        assert_eq!(entry.columns.original_name("first_name"), Some("first-name"));
        assert_eq!(entry.columns.len(), 3);
    }

    #[test]
    fn test_canonical_column_collision_fails_fast() {
        let err = resolve_catalog(
            &DestinationCatalog::new(vec![stream("public", "users", &["name", "NAME"])]),
            &DefaultTableNameGenerator::default(),
            &DefaultColumnNameGenerator,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LoadError::Config(ConfigError::ColumnCollision { .. })
        ));
    }

    #[test]
    fn test_display_column_collision_fails_fast() {
        // Generator whose canonical forms stay distinct while every
        // display name folds to the same identifier.
        struct FoldingDisplayGenerator;
        impl ColumnNameGenerator for FoldingDisplayGenerator {
            fn column_name(&self, field: &str) -> ColumnName {
                ColumnName {
                    display: "col".to_string(),
                    canonical: field.to_string(),
                }
            }
        }

        let err = resolve_catalog(
            &DestinationCatalog::new(vec![stream("public", "users", &["a", "b"])]),
            &DefaultTableNameGenerator::default(),
            &FoldingDisplayGenerator,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LoadError::Config(ConfigError::ColumnCollision { .. })
        ));
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let err = resolve_catalog(
            &DestinationCatalog::default(),
            &DefaultTableNameGenerator::default(),
            &DefaultColumnNameGenerator,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::LoadError::Config(ConfigError::EmptyCatalog)
        ));
    }

    #[test]
    fn test_direct_load_mode_has_no_raw_tables() {
        let generator = DefaultTableNameGenerator {
            default_namespace: "public".into(),
            raw_namespace: None,
        };
        let catalog = resolve_catalog(
            &DestinationCatalog::new(vec![stream("public", "users", &["id"])]),
            &generator,
            &DefaultColumnNameGenerator,
        )
        .unwrap();
        let names = catalog
            .table_names(&StreamDescriptor::new("public", "users"))
            .unwrap();
        assert!(names.raw.is_none());
    }

    #[test]
    fn test_destination_schema_projection() {
        let catalog = resolve(vec![stream("public", "users", &["id", "e-mail"])]);
        let config = stream("public", "users", &["id", "e-mail"]);
        let entry = catalog
            .entry(&StreamDescriptor::new("public", "users"))
            .unwrap();
        let dest = entry.destination_schema(&config);
        let names: Vec<&str> = dest.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["id", "e_mail"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let streams = || {
            vec![
                stream("public", "My-Table", &["id"]),
                stream("public", "My_Table", &["id"]),
            ]
        };
        let a = resolve(streams());
        let b = resolve(streams());
        for (desc, entry) in a.iter() {
            assert_eq!(
                b.table_names(desc).unwrap().final_table,
                entry.table_names.final_table
            );
        }
    }
}
