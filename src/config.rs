//! Engine and stream configuration.
//!
//! The stream catalog is supplied once at sync start and is read-only
//! afterwards. [`LoadConfig`] carries the engine-level knobs: memory
//! budget, transport selection, framing, and the column-change behavior
//! used by schema synchronization.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::message::StreamDescriptor;
use crate::schema::ColumnChangeBehavior;
use crate::types::ObjectSchema;

/// How records of a stream are materialized into the final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every record is appended.
    Append,
    /// Records are upserted by identifier fields; the newest wins.
    Dedupe,
    /// The final table is replaced by this sync's generation of rows.
    Overwrite,
}

/// Per-stream declaration from the source catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Logical stream identity.
    pub descriptor: StreamDescriptor,
    /// Declared type tree, one level of nesting at most once it reaches
    /// the destination.
    pub schema: ObjectSchema,
    /// Identifier fields used for deduplication, in declared order.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Cursor fields used by the source for incremental extraction.
    #[serde(default)]
    pub cursor: Vec<String>,
    /// Materialization mode.
    pub sync_mode: SyncMode,
    /// Generation of rows produced by this sync.
    #[serde(default)]
    pub generation_id: i64,
    /// Oldest generation that may survive in the final table. Rows from
    /// earlier generations are swapped out on an overwrite commit.
    #[serde(default)]
    pub min_generation_id: i64,
}

/// The full set of streams declared for one sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationCatalog {
    /// Streams in catalog-declared order. The order is meaningful: name
    /// collision resolution processes streams in this order.
    pub streams: Vec<StreamConfig>,
}

impl DestinationCatalog {
    /// Creates a catalog from a list of streams, keeping their order.
    #[must_use]
    pub fn new(streams: Vec<StreamConfig>) -> Self {
        Self { streams }
    }

    /// Looks up a stream by descriptor.
    #[must_use]
    pub fn stream(&self, descriptor: &StreamDescriptor) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| &s.descriptor == descriptor)
    }
}

/// Where the ingestion byte stream comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Read from standard input.
    Stdin,
    /// Read from an externally pre-created local channel (named pipe or
    /// file), polled until it materializes.
    Pipe {
        /// Path of the channel.
        path: PathBuf,
        /// Poll interval while waiting for the channel to appear.
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        /// Hard deadline: past this, the sync fails with a transport error.
        #[serde(default = "default_transport_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_transport_timeout_ms() -> u64 {
    60_000
}

/// How messages are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Newline-delimited self-describing JSON. Per-message size is the
    /// byte-offset delta between successive parses.
    #[default]
    Jsonl,
    /// 4-byte big-endian length prefix followed by the payload. Per-message
    /// size is the declared prefix.
    LengthPrefixed,
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Shared byte budget for buffered messages. Buffering a message
    /// requires a reservation of its serialized size; producers suspend
    /// when the budget is exhausted.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,
    /// Ingestion transport.
    pub transport: TransportConfig,
    /// Message framing.
    #[serde(default)]
    pub framing: Framing,
    /// Behavior applied when a column's declared type changes.
    #[serde(default)]
    pub column_change_behavior: ColumnChangeBehavior,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget(),
            transport: TransportConfig::Stdin,
            framing: Framing::default(),
            column_change_behavior: ColumnChangeBehavior::default(),
        }
    }
}

fn default_memory_budget() -> u64 {
    // 64 MiB: enough headroom for wide rows without risking container OOM.
    64 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        let cfg: LoadConfig = serde_json::from_str(r#"{"transport": {"kind": "stdin"}}"#).unwrap();
        assert_eq!(cfg.memory_budget_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.framing, Framing::Jsonl);
        assert!(matches!(cfg.transport, TransportConfig::Stdin));
    }

    #[test]
    fn test_pipe_transport_defaults() {
        let cfg: TransportConfig =
            serde_json::from_str(r#"{"kind": "pipe", "path": "/tmp/feed"}"#).unwrap();
        match cfg {
            TransportConfig::Pipe {
                path,
                poll_interval_ms,
                timeout_ms,
            } => {
                assert_eq!(path, PathBuf::from("/tmp/feed"));
                assert_eq!(poll_interval_ms, 100);
                assert_eq!(timeout_ms, 60_000);
            }
            TransportConfig::Stdin => panic!("expected pipe"),
        }
    }

    #[test]
    fn test_catalog_lookup() {
        use crate::types::{FieldSchema, FieldType};

        let mut schema = ObjectSchema::new();
        schema.insert("id", FieldSchema::required(FieldType::Long));
        let catalog = DestinationCatalog::new(vec![StreamConfig {
            descriptor: StreamDescriptor::new("public", "users"),
            schema,
            primary_key: vec!["id".into()],
            cursor: vec![],
            sync_mode: SyncMode::Dedupe,
            generation_id: 1,
            min_generation_id: 0,
        }]);
        assert!(catalog
            .stream(&StreamDescriptor::new("public", "users"))
            .is_some());
        assert!(catalog
            .stream(&StreamDescriptor::new("public", "orders"))
            .is_none());
    }
}
