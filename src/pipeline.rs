//! The full load pipeline, setup through final commits.
//!
//! One sync runs these phases in order:
//!
//! 1. resolve the naming catalog and ensure every raw landing table exists
//! 2. snapshot destination status and read persisted per-stream state
//! 3. run migrations (lockstep, per-stream isolation)
//! 4. reconcile each stream's final-table schema
//! 5. soft-reset streams whose sticky flag is set
//! 6. drain the ingestion channel into raw tables under the byte budget
//! 7. typed-commit every surviving stream, concurrently
//!
//! A stream that fails in phases 3-5 or 7 is dropped from the remaining
//! phases and reported in the [`LoadReport`]; its records still land in
//! the raw table so the next sync can pick them up. Only catalog
//! resolution, transport failures, and destination-wide faults abort the
//! whole sync.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use uuid::Uuid;

use crate::backend::{Backend, RawRecord, StatementGenerator};
use crate::catalog::{
    raw_table_schema, resolve_catalog, CatalogEntry, ColumnNameGenerator, TableCatalog, TableName,
    TableNameGenerator,
};
use crate::commit::TypedCommitExecutor;
use crate::config::{DestinationCatalog, LoadConfig, StreamConfig};
use crate::error::LoadResult;
use crate::ingest::{
    open_transport, CheckpointSink, EventRouter, FrameReader, RecordSink, ReservationHandle,
    ReservationManager,
};
use crate::message::{RecordMessage, StreamDescriptor};
use crate::migrate::{
    run_migrations, state_needs_soft_reset, Migration, StreamState, NEEDS_SOFT_RESET_KEY,
};
use crate::schema::{SchemaSynchronizer, TableSchema};
use crate::status::{gather_initial_status, DestinationInitialStatus, TableStatus};
use crate::types::ObjectSchema;

/// A stream dropped from the sync, with the failure that dropped it.
#[derive(Debug, Clone)]
pub struct FailedStream {
    /// The dropped stream.
    pub descriptor: StreamDescriptor,
    /// Rendered failure.
    pub error: String,
}

/// What one sync accomplished.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Streams committed to their final tables.
    pub completed: Vec<StreamDescriptor>,
    /// Streams dropped mid-sync.
    pub failed: Vec<FailedStream>,
    /// Records routed into raw tables.
    pub records: u64,
    /// Serialized record bytes routed.
    pub bytes: u64,
    /// Checkpoints committed.
    pub checkpoints: u64,
}

/// Writes accepted records straight into their stream's raw table.
///
/// Targets cover every resolved stream, including ones later phases drop:
/// raw-table writes are idempotent groundwork for the next sync.
struct RawTableSink {
    backend: Arc<dyn Backend>,
    targets: HashMap<StreamDescriptor, (TableName, i64)>,
}

impl RawTableSink {
    fn new(
        backend: Arc<dyn Backend>,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
    ) -> Self {
        let targets = catalog
            .streams
            .iter()
            .filter_map(|stream| {
                let names = table_catalog.table_names(&stream.descriptor)?;
                let raw = names.raw.clone()?;
                Some((stream.descriptor.clone(), (raw, stream.generation_id)))
            })
            .collect();
        Self { backend, targets }
    }
}

#[async_trait]
impl RecordSink for RawTableSink {
    async fn accept(
        &self,
        record: RecordMessage,
        reservation: ReservationHandle,
    ) -> LoadResult<()> {
        let Some((table, generation_id)) = self.targets.get(&record.stream) else {
            tracing::warn!(stream = %record.stream, "record for undeclared stream, dropping");
            return Ok(());
        };
        let row = RawRecord {
            raw_id: Uuid::new_v4().to_string(),
            extracted_at_ms: record.emitted_at_ms,
            generation_id: *generation_id,
            data: record.data,
            meta: record.meta,
        };
        self.backend.insert_records(table, vec![row]).await?;
        // The row is out of memory once written; give the bytes back.
        reservation.release();
        Ok(())
    }
}

/// Orchestrates one sync end to end.
pub struct LoadPipeline {
    config: LoadConfig,
    backend: Arc<dyn Backend>,
    generator: Arc<dyn StatementGenerator>,
    table_names: Arc<dyn TableNameGenerator>,
    column_names: Arc<dyn ColumnNameGenerator>,
    checkpoints: Arc<dyn CheckpointSink>,
    migrations: Vec<Box<dyn Migration>>,
}

impl LoadPipeline {
    /// Creates a pipeline with no migrations.
    #[must_use]
    pub fn new(
        config: LoadConfig,
        backend: Arc<dyn Backend>,
        generator: Arc<dyn StatementGenerator>,
        table_names: Arc<dyn TableNameGenerator>,
        column_names: Arc<dyn ColumnNameGenerator>,
        checkpoints: Arc<dyn CheckpointSink>,
    ) -> Self {
        Self {
            config,
            backend,
            generator,
            table_names,
            column_names,
            checkpoints,
            migrations: Vec::new(),
        }
    }

    /// Replaces the migration list, run in the given order.
    #[must_use]
    pub fn with_migrations(mut self, migrations: Vec<Box<dyn Migration>>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Runs one sync, reading from the configured transport.
    ///
    /// # Errors
    ///
    /// Sync-fatal failures only; per-stream failures are reported in the
    /// [`LoadReport`].
    pub async fn run(&self, catalog: &DestinationCatalog) -> LoadResult<LoadReport> {
        let stream = open_transport(&self.config.transport).await?;
        let reader = FrameReader::new(stream, self.config.framing);
        self.run_with_reader(catalog, reader).await
    }

    /// Runs one sync over an already-open framed reader.
    ///
    /// # Errors
    ///
    /// Same contract as [`LoadPipeline::run`].
    pub async fn run_with_reader<R: AsyncBufRead + Unpin + Send>(
        &self,
        catalog: &DestinationCatalog,
        mut reader: FrameReader<R>,
    ) -> LoadResult<LoadReport> {
        let table_catalog = resolve_catalog(catalog, &*self.table_names, &*self.column_names)?;
        let mut failed: Vec<FailedStream> = Vec::new();

        self.ensure_raw_tables(catalog, &table_catalog).await?;
        let mut states = self.initial_states(catalog, &table_catalog).await?;

        let migration_failures = run_migrations(
            &*self.backend,
            catalog,
            &table_catalog,
            &mut states,
            &self.migrations,
        )
        .await?;
        for (descriptor, error) in migration_failures {
            failed.push(FailedStream {
                descriptor,
                error: error.to_string(),
            });
        }

        self.sync_schemas(catalog, &table_catalog, &mut states, &mut failed)
            .await;
        self.run_soft_resets(catalog, &table_catalog, &mut states, &mut failed)
            .await?;

        let reservations = ReservationManager::new(self.config.memory_budget_bytes);
        let sink = Arc::new(RawTableSink::new(
            Arc::clone(&self.backend),
            catalog,
            &table_catalog,
        ));
        let router = EventRouter::new(reservations, sink, Arc::clone(&self.checkpoints));
        let summary = router.drain(&mut reader).await?;
        tracing::info!(
            records = summary.records,
            bytes = summary.bytes,
            checkpoints = summary.checkpoints,
            "ingestion drained"
        );

        let completed = self
            .commit_streams(catalog, &table_catalog, &states, &mut failed)
            .await;

        Ok(LoadReport {
            completed,
            failed,
            records: summary.records,
            bytes: summary.bytes,
            checkpoints: summary.checkpoints,
        })
    }

    async fn ensure_raw_tables(
        &self,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
    ) -> LoadResult<()> {
        for stream in &catalog.streams {
            let Some(names) = table_catalog.table_names(&stream.descriptor) else {
                continue;
            };
            if let Some(raw) = &names.raw {
                self.backend.create_table(raw, &raw_table_schema()).await?;
            }
        }
        Ok(())
    }

    async fn initial_states(
        &self,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
    ) -> LoadResult<HashMap<StreamDescriptor, StreamState>> {
        let refs: Vec<&StreamConfig> = catalog.streams.iter().collect();
        let statuses = gather_initial_status(&*self.backend, &refs, table_catalog).await?;

        let mut states = HashMap::with_capacity(catalog.streams.len());
        for stream in &catalog.streams {
            let descriptor = stream.descriptor.clone();
            let destination_state = self.backend.read_destination_state(&descriptor).await?;
            let needs_soft_reset = state_needs_soft_reset(destination_state.as_ref());
            let initial_status = statuses.get(&descriptor).copied().unwrap_or(
                DestinationInitialStatus {
                    real_table: TableStatus::missing(),
                    temp_table: TableStatus::missing(),
                },
            );
            states.insert(
                descriptor,
                StreamState {
                    initial_status,
                    destination_state,
                    needs_soft_reset,
                },
            );
        }
        Ok(states)
    }

    async fn sync_schemas(
        &self,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
        states: &mut HashMap<StreamDescriptor, StreamState>,
        failed: &mut Vec<FailedStream>,
    ) {
        let sync = SchemaSynchronizer::new(&*self.backend, &*self.generator);
        for stream in &catalog.streams {
            if !states.contains_key(&stream.descriptor) {
                continue;
            }
            let Some(entry) = table_catalog.entry(&stream.descriptor) else {
                continue;
            };
            if let Err(error) = self.sync_stream_schema(&sync, stream, entry).await {
                tracing::error!(
                    stream = %stream.descriptor,
                    %error,
                    "schema sync failed; stream dropped from this sync"
                );
                states.remove(&stream.descriptor);
                failed.push(FailedStream {
                    descriptor: stream.descriptor.clone(),
                    error: error.to_string(),
                });
            }
        }
    }

    async fn sync_stream_schema(
        &self,
        sync: &SchemaSynchronizer<'_>,
        stream: &StreamConfig,
        entry: &CatalogEntry,
    ) -> LoadResult<()> {
        let final_table = &entry.table_names.final_table;
        let incoming = TableSchema {
            columns: entry.destination_schema(stream),
            identifier_fields: entry.destination_primary_key(stream),
        };
        let existing = match self.backend.table_schema(final_table).await? {
            Some(columns) => TableSchema {
                columns,
                identifier_fields: self.backend.identifier_fields(final_table).await?,
            },
            None => {
                // Create empty and let reconciliation add every column, so
                // first creation and evolution share one code path.
                self.backend
                    .create_table(final_table, &ObjectSchema::new())
                    .await?;
                TableSchema::default()
            }
        };
        let result = sync
            .reconcile(
                final_table,
                &existing,
                &incoming,
                self.config.column_change_behavior,
            )
            .await?;
        if let Some(pending) = result.pending {
            pending.apply(&*self.backend).await?;
        }
        Ok(())
    }

    async fn run_soft_resets(
        &self,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
        states: &mut HashMap<StreamDescriptor, StreamState>,
        failed: &mut Vec<FailedStream>,
    ) -> LoadResult<()> {
        let executor = TypedCommitExecutor::new(&*self.backend, &*self.generator);
        for stream in &catalog.streams {
            let needs = states
                .get(&stream.descriptor)
                .is_some_and(|s| s.needs_soft_reset);
            if !needs {
                continue;
            }
            let Some(entry) = table_catalog.entry(&stream.descriptor) else {
                continue;
            };
            match executor.soft_reset(stream, entry).await {
                Ok(()) => {
                    self.clear_soft_reset_flag(&stream.descriptor, states).await?;
                }
                Err(error) => {
                    tracing::error!(
                        stream = %stream.descriptor,
                        %error,
                        "soft reset failed; stream dropped from this sync"
                    );
                    states.remove(&stream.descriptor);
                    failed.push(FailedStream {
                        descriptor: stream.descriptor.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn clear_soft_reset_flag(
        &self,
        descriptor: &StreamDescriptor,
        states: &mut HashMap<StreamDescriptor, StreamState>,
    ) -> LoadResult<()> {
        let mut blob = states
            .get(descriptor)
            .and_then(|s| s.destination_state.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        if let Some(object) = blob.as_object_mut() {
            object.insert(NEEDS_SOFT_RESET_KEY.to_string(), Value::Bool(false));
        }
        self.backend.write_destination_state(descriptor, &blob).await?;
        if let Some(state) = states.get_mut(descriptor) {
            state.destination_state = Some(blob);
            state.needs_soft_reset = false;
        }
        Ok(())
    }

    async fn commit_streams(
        &self,
        catalog: &DestinationCatalog,
        table_catalog: &TableCatalog,
        states: &HashMap<StreamDescriptor, StreamState>,
        failed: &mut Vec<FailedStream>,
    ) -> Vec<StreamDescriptor> {
        let executor = TypedCommitExecutor::new(&*self.backend, &*self.generator);
        let mut participants: Vec<&StreamConfig> = Vec::new();
        let mut futures = Vec::new();
        for stream in &catalog.streams {
            if !states.contains_key(&stream.descriptor) {
                continue;
            }
            let Some(entry) = table_catalog.entry(&stream.descriptor) else {
                continue;
            };
            participants.push(stream);
            futures.push(executor.commit_stream(stream, entry));
        }

        let results = join_all(futures).await;
        let mut completed = Vec::new();
        for (stream, result) in participants.into_iter().zip(results) {
            match result {
                Ok(outcome) => {
                    tracing::info!(stream = %stream.descriptor, ?outcome, "stream committed");
                    completed.push(stream.descriptor.clone());
                }
                Err(error) => {
                    tracing::error!(stream = %stream.descriptor, %error, "commit failed");
                    failed.push(FailedStream {
                        descriptor: stream.descriptor.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }
        completed
    }
}
