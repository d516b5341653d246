//! Initial destination status gathering.
//!
//! Before migrations run, the engine snapshots each stream's physical
//! state: does the real (final) table exist, is it empty, and likewise for
//! the soft-reset temp table. The snapshot is taken once, in parallel
//! across streams, and is only invalidated and regathered by migrations.

use std::collections::HashMap;

use futures::future::try_join_all;

use crate::backend::Backend;
use crate::catalog::{TableCatalog, TableName};
use crate::commit::soft_reset_table_name;
use crate::config::StreamConfig;
use crate::error::{BackendError, LoadResult};
use crate::message::StreamDescriptor;

/// Physical state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatus {
    /// Whether the table exists at the destination.
    pub exists: bool,
    /// Whether the table has zero rows. `false` when the table is missing.
    pub is_empty: bool,
}

impl TableStatus {
    /// Status of a table that does not exist.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_empty: false,
        }
    }
}

/// Per-stream snapshot of destination state, created once at sync start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationInitialStatus {
    /// The final (user-facing) table.
    pub real_table: TableStatus,
    /// The soft-reset temp table, if a previous sync left one behind.
    pub temp_table: TableStatus,
}

async fn table_status(
    backend: &dyn Backend,
    name: &TableName,
) -> Result<TableStatus, BackendError> {
    match backend.count_rows(name).await? {
        None => Ok(TableStatus::missing()),
        Some(count) => Ok(TableStatus {
            exists: true,
            is_empty: count == 0,
        }),
    }
}

async fn stream_status(
    backend: &dyn Backend,
    stream: &StreamDescriptor,
    catalog: &TableCatalog,
) -> LoadResult<(StreamDescriptor, DestinationInitialStatus)> {
    // Streams absent from the catalog cannot occur here; resolve_catalog
    // covers the whole declared catalog. Treat it defensively as missing.
    let Some(names) = catalog.table_names(stream) else {
        return Ok((
            stream.clone(),
            DestinationInitialStatus {
                real_table: TableStatus::missing(),
                temp_table: TableStatus::missing(),
            },
        ));
    };
    let real_table = table_status(backend, &names.final_table).await?;
    let temp_table = table_status(backend, &soft_reset_table_name(&names.final_table)).await?;
    Ok((
        stream.clone(),
        DestinationInitialStatus {
            real_table,
            temp_table,
        },
    ))
}

/// Queries the destination for every stream's initial status, in parallel
/// per stream.
///
/// # Errors
///
/// Propagates the first backend failure; status gathering is cheap and
/// precedes any per-stream isolation, so a failing destination fails the
/// sync here.
pub async fn gather_initial_status(
    backend: &dyn Backend,
    streams: &[&StreamConfig],
    catalog: &TableCatalog,
) -> LoadResult<HashMap<StreamDescriptor, DestinationInitialStatus>> {
    let futures = streams
        .iter()
        .map(|s| stream_status(backend, &s.descriptor, catalog));
    let gathered = try_join_all(futures).await?;
    Ok(gathered.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::catalog::{
        raw_table_schema, resolve_catalog, DefaultColumnNameGenerator, DefaultTableNameGenerator,
    };
    use crate::config::{DestinationCatalog, SyncMode};
    use crate::types::{FieldSchema, FieldType, ObjectSchema};

    fn stream(name: &str) -> StreamConfig {
        let mut schema = ObjectSchema::new();
        schema.insert("id", FieldSchema::required(FieldType::Long));
        StreamConfig {
            descriptor: StreamDescriptor::new("public", name),
            schema,
            primary_key: vec!["id".into()],
            cursor: vec![],
            sync_mode: SyncMode::Append,
            generation_id: 0,
            min_generation_id: 0,
        }
    }

    #[tokio::test]
    async fn test_gather_reports_missing_and_existing_tables() {
        let backend = InMemoryBackend::new();
        let streams = vec![stream("users"), stream("orders")];
        let catalog = resolve_catalog(
            &DestinationCatalog::new(streams.clone()),
            &DefaultTableNameGenerator::default(),
            &DefaultColumnNameGenerator,
        )
        .unwrap();

        // Only "users" has a final table, and it is empty.
        let users_final = catalog
            .table_names(&StreamDescriptor::new("public", "users"))
            .unwrap()
            .final_table
            .clone();
        backend
            .create_table(&users_final, &raw_table_schema())
            .await
            .unwrap();

        let refs: Vec<&StreamConfig> = streams.iter().collect();
        let status = gather_initial_status(&backend, &refs, &catalog)
            .await
            .unwrap();

        let users = &status[&StreamDescriptor::new("public", "users")];
        assert!(users.real_table.exists);
        assert!(users.real_table.is_empty);
        assert!(!users.temp_table.exists);

        let orders = &status[&StreamDescriptor::new("public", "orders")];
        assert!(!orders.real_table.exists);
    }

    #[tokio::test]
    async fn test_gather_sees_soft_reset_temp_table() {
        let backend = InMemoryBackend::new();
        let streams = vec![stream("users")];
        let catalog = resolve_catalog(
            &DestinationCatalog::new(streams.clone()),
            &DefaultTableNameGenerator::default(),
            &DefaultColumnNameGenerator,
        )
        .unwrap();

        let final_table = catalog
            .table_names(&StreamDescriptor::new("public", "users"))
            .unwrap()
            .final_table
            .clone();
        backend
            .create_table(&soft_reset_table_name(&final_table), &raw_table_schema())
            .await
            .unwrap();

        let refs: Vec<&StreamConfig> = streams.iter().collect();
        let status = gather_initial_status(&backend, &refs, &catalog)
            .await
            .unwrap();
        let users = &status[&StreamDescriptor::new("public", "users")];
        assert!(!users.real_table.exists);
        assert!(users.temp_table.exists);
        assert!(users.temp_table.is_empty);
    }
}
