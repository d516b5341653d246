//! Typed-commit execution: raw landing table → final table.
//!
//! Every commit is tried on the unsafe fast path first: one statement,
//! any cast failure fails it wholesale. When the paired generator judges
//! the failure retryable, the safe variant re-runs the same write with
//! per-value cast handling — failed values are nulled and recorded in
//! row-level metadata, and every row still lands. Failures the generator
//! does not vouch for propagate unchanged.
//!
//! Soft resets and stale-generation overwrites share one mechanism:
//! rebuild the final table's content in a temp table, then atomically
//! swap it into place.

use crate::backend::{Backend, CommitMode, StatementGenerator, TypedCommitSpec};
use crate::catalog::{CatalogEntry, TableName};
use crate::config::{StreamConfig, SyncMode};
use crate::error::LoadResult;

/// Suffix of the temp table used for soft resets and overwrite rebuilds.
pub const SOFT_RESET_SUFFIX: &str = "_ab_soft_reset";

/// The temp table paired with a final table for rebuild-and-swap.
#[must_use]
pub fn soft_reset_table_name(final_table: &TableName) -> TableName {
    TableName::new(
        final_table.namespace.clone(),
        format!("{}{SOFT_RESET_SUFFIX}", final_table.name),
    )
}

/// How one stream's commit completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The unsafe fast path succeeded.
    Fast,
    /// The fast path failed retryably; the safe variant completed.
    SafeFallback,
    /// The stream has no raw table (direct-load backend); nothing to commit.
    SkippedNoRawTable,
}

/// Runs typed commits for streams, including rebuild-and-swap paths.
pub struct TypedCommitExecutor<'a> {
    backend: &'a dyn Backend,
    generator: &'a dyn StatementGenerator,
}

impl<'a> TypedCommitExecutor<'a> {
    /// Creates an executor over a backend and its statement generator.
    #[must_use]
    pub fn new(backend: &'a dyn Backend, generator: &'a dyn StatementGenerator) -> Self {
        Self { backend, generator }
    }

    /// Commits one stream's raw records into its final table.
    ///
    /// Only raw rows not yet stamped with a loaded-at marker are typed;
    /// rows a previous commit already landed are left alone, so re-running
    /// a commit or appending across syncs never duplicates final rows.
    ///
    /// For [`SyncMode::Overwrite`] streams whose final table still holds
    /// rows from a generation older than `min_generation_id`, the commit
    /// is rebuilt in a temp table and swapped in, so stale rows never mix
    /// with the new generation.
    ///
    /// # Errors
    ///
    /// Backend failures the generator does not classify as retryable.
    pub async fn commit_stream(
        &self,
        stream: &StreamConfig,
        entry: &CatalogEntry,
    ) -> LoadResult<CommitOutcome> {
        let Some(raw) = &entry.table_names.raw else {
            return Ok(CommitOutcome::SkippedNoRawTable);
        };
        let final_table = &entry.table_names.final_table;

        if stream.sync_mode == SyncMode::Overwrite
            && self.has_stale_generation(final_table, stream).await?
        {
            tracing::info!(
                stream = %stream.descriptor,
                min_generation = stream.min_generation_id,
                "final table holds stale generations, rebuilding via swap"
            );
            let bound = Some(stream.min_generation_id);
            return self
                .rebuild_and_swap(stream, entry, raw, CommitMode::Unsafe, bound)
                .await;
        }

        self.run_commit(stream, entry, raw, final_table, true, None).await
    }

    /// Rebuilds a stream's final table from its raw records and swaps it in.
    ///
    /// Always uses the safe commit variant: a soft reset exists to recover
    /// from schema drift, so it must absorb any value the old schema let
    /// through.
    ///
    /// # Errors
    ///
    /// Backend failures; there is no unsafe attempt to fall back from.
    pub async fn soft_reset(
        &self,
        stream: &StreamConfig,
        entry: &CatalogEntry,
    ) -> LoadResult<()> {
        let Some(raw) = &entry.table_names.raw else {
            tracing::debug!(stream = %stream.descriptor, "no raw table, soft reset is a no-op");
            return Ok(());
        };
        tracing::info!(stream = %stream.descriptor, "soft reset");
        self.rebuild_and_swap(stream, entry, raw, CommitMode::Safe, None).await?;
        Ok(())
    }

    async fn run_commit(
        &self,
        stream: &StreamConfig,
        entry: &CatalogEntry,
        source: &TableName,
        target: &TableName,
        unloaded_only: bool,
        min_generation_id: Option<i64>,
    ) -> LoadResult<CommitOutcome> {
        let schema = entry.destination_schema(stream);
        let primary_key = entry.destination_primary_key(stream);
        let spec = TypedCommitSpec {
            source,
            target,
            schema: &schema,
            columns: &entry.columns,
            primary_key: &primary_key,
            dedupe: stream.sync_mode == SyncMode::Dedupe,
            unloaded_only,
            min_generation_id,
            mode: CommitMode::Unsafe,
        };

        match self.backend.execute(&self.generator.typed_commit(&spec)).await {
            Ok(()) => Ok(CommitOutcome::Fast),
            Err(error) if self.generator.is_retryable(&error) => {
                tracing::warn!(
                    stream = %stream.descriptor,
                    %error,
                    "fast-path commit failed, re-running safe variant"
                );
                let safe = TypedCommitSpec {
                    mode: CommitMode::Safe,
                    ..spec
                };
                self.backend.execute(&self.generator.typed_commit(&safe)).await?;
                Ok(CommitOutcome::SafeFallback)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Re-types the raw history into a temp table and swaps it in. The
    /// rebuild deliberately ignores loaded-at markers: it replaces the
    /// final table wholesale, so already-committed rows must be re-typed
    /// rather than skipped. A generation bound, when given, drops rows
    /// from superseded refresh cycles.
    async fn rebuild_and_swap(
        &self,
        stream: &StreamConfig,
        entry: &CatalogEntry,
        raw: &TableName,
        first_attempt: CommitMode,
        min_generation_id: Option<i64>,
    ) -> LoadResult<CommitOutcome> {
        let final_table = &entry.table_names.final_table;
        let temp = soft_reset_table_name(final_table);
        let schema = entry.destination_schema(stream);
        let primary_key = entry.destination_primary_key(stream);

        // A leftover temp from an interrupted run is stale; start clean.
        self.backend.drop_table(&temp).await?;
        self.backend.create_table(&temp, &schema).await?;

        let outcome = match first_attempt {
            CommitMode::Unsafe => {
                self.run_commit(stream, entry, raw, &temp, false, min_generation_id)
                    .await?
            }
            CommitMode::Safe => {
                let spec = TypedCommitSpec {
                    source: raw,
                    target: &temp,
                    schema: &schema,
                    columns: &entry.columns,
                    primary_key: &primary_key,
                    dedupe: stream.sync_mode == SyncMode::Dedupe,
                    unloaded_only: false,
                    min_generation_id,
                    mode: CommitMode::Safe,
                };
                self.backend.execute(&self.generator.typed_commit(&spec)).await?;
                CommitOutcome::SafeFallback
            }
        };

        if !primary_key.is_empty() {
            self.backend
                .execute(&self.generator.set_identifier_fields(&temp, &primary_key))
                .await?;
        }
        self.backend.overwrite_table(&temp, final_table).await?;
        Ok(outcome)
    }

    async fn has_stale_generation(
        &self,
        final_table: &TableName,
        stream: &StreamConfig,
    ) -> LoadResult<bool> {
        let generation = self.backend.get_generation_id(final_table).await?;
        Ok(generation.is_some_and(|g| g < stream.min_generation_id))
    }
}
