//! Migration orchestration.
//!
//! Migrations are idempotent operations over `(stream config, initial
//! status)` that run once per sync, in declared order, in lockstep across
//! all streams: within one migration every stream runs concurrently, and
//! no stream starts migration N+1 before every stream finished N. After
//! each migration, streams whose initial status was invalidated are
//! refetched in one batched call.
//!
//! Migration failures are never retried within a sync — the next sync
//! simply runs the idempotent migration again. A failed stream is dropped
//! from the rest of the pipeline; siblings continue.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use crate::backend::Backend;
use crate::catalog::{TableCatalog, TableNames};
use crate::config::{DestinationCatalog, StreamConfig};
use crate::error::{LoadError, LoadResult};
use crate::message::StreamDescriptor;
use crate::status::{gather_initial_status, DestinationInitialStatus};

/// Key of the one documented field in the otherwise-opaque persisted
/// destination state blob.
pub const NEEDS_SOFT_RESET_KEY: &str = "needsSoftReset";

/// Reads the documented soft-reset flag out of a persisted state blob.
#[must_use]
pub fn state_needs_soft_reset(state: Option<&Value>) -> bool {
    state
        .and_then(|s| s.get(NEEDS_SOFT_RESET_KEY))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Mutable per-stream state threaded through migrations and the rest of
/// the sync.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Destination snapshot; refetched when a migration invalidates it.
    pub initial_status: DestinationInitialStatus,
    /// Opaque persisted state blob, if the destination has one.
    pub destination_state: Option<Value>,
    /// Sticky across migrations: once any migration requests a soft reset,
    /// the flag stays set for the rest of the sync.
    pub needs_soft_reset: bool,
}

/// Everything one migration sees for one stream.
pub struct MigrationContext<'a> {
    /// The stream's declared configuration.
    pub stream: &'a StreamConfig,
    /// The stream's resolved physical tables.
    pub table_names: &'a TableNames,
    /// Destination snapshot as of the last (re)gather.
    pub initial_status: &'a DestinationInitialStatus,
    /// Current persisted state blob.
    pub state: Option<&'a Value>,
    /// Destination access.
    pub backend: &'a dyn Backend,
}

/// What one migration did for one stream.
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    /// The migration changed physical state the cached
    /// [`DestinationInitialStatus`] no longer reflects; refetch it before
    /// the next migration.
    pub invalidate_initial_status: bool,
    /// The stream's final table must be rebuilt and swapped before commits.
    pub needs_soft_reset: bool,
    /// Replacement persisted state blob, written through immediately.
    pub updated_state: Option<Value>,
}

impl MigrationResult {
    /// A result that changes nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::default()
    }
}

/// One idempotent migration, run once per sync for every stream.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Stable name for logs.
    fn name(&self) -> &str;

    /// Runs the migration for one stream.
    async fn run(&self, ctx: &MigrationContext<'_>) -> LoadResult<MigrationResult>;
}

/// Runs all migrations in declared order across all streams.
///
/// Returns the streams that failed; they are removed from `states` and the
/// caller must not commit them. Sibling streams are unaffected.
///
/// # Errors
///
/// Only batched status refetch and state persistence failures abort the
/// whole sync — per-stream migration failures are isolated into the
/// returned list.
pub async fn run_migrations(
    backend: &dyn Backend,
    catalog: &DestinationCatalog,
    table_catalog: &TableCatalog,
    states: &mut HashMap<StreamDescriptor, StreamState>,
    migrations: &[Box<dyn Migration>],
) -> LoadResult<Vec<(StreamDescriptor, LoadError)>> {
    let mut failed: Vec<(StreamDescriptor, LoadError)> = Vec::new();

    for migration in migrations {
        let mut participants: Vec<&StreamDescriptor> = Vec::new();
        let mut futures = Vec::new();
        for (descriptor, state) in states.iter() {
            let (Some(stream), Some(table_names)) = (
                catalog.stream(descriptor),
                table_catalog.table_names(descriptor),
            ) else {
                continue;
            };
            let ctx = MigrationContext {
                stream,
                table_names,
                initial_status: &state.initial_status,
                state: state.destination_state.as_ref(),
                backend,
            };
            participants.push(descriptor);
            futures.push(async move { migration.run(&ctx).await });
        }

        let results = join_all(futures).await;
        let outcomes: Vec<(StreamDescriptor, LoadResult<MigrationResult>)> = participants
            .into_iter()
            .cloned()
            .zip(results)
            .collect();

        let mut invalidated: Vec<StreamDescriptor> = Vec::new();
        for (descriptor, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    // Participants are drawn from `states`, so this lookup
                    // cannot miss.
                    let Some(state) = states.get_mut(&descriptor) else {
                        continue;
                    };
                    state.needs_soft_reset |= result.needs_soft_reset;
                    if let Some(updated) = result.updated_state {
                        backend.write_destination_state(&descriptor, &updated).await?;
                        state.destination_state = Some(updated);
                    }
                    if result.invalidate_initial_status {
                        invalidated.push(descriptor);
                    }
                }
                Err(error) => {
                    tracing::error!(
                        stream = %descriptor,
                        migration = migration.name(),
                        error = %error,
                        "migration failed; stream dropped from this sync"
                    );
                    states.remove(&descriptor);
                    failed.push((descriptor, error));
                }
            }
        }

        if !invalidated.is_empty() {
            tracing::debug!(
                migration = migration.name(),
                streams = invalidated.len(),
                "refetching invalidated initial status"
            );
            let configs: Vec<&StreamConfig> = invalidated
                .iter()
                .filter_map(|d| catalog.stream(d))
                .collect();
            let fresh = gather_initial_status(backend, &configs, table_catalog).await?;
            for (descriptor, status) in fresh {
                if let Some(state) = states.get_mut(&descriptor) {
                    state.initial_status = status;
                }
            }
        }
    }

    Ok(failed)
}
