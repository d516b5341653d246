//! Wire message model for the ingestion channel.
//!
//! Messages arrive as a self-describing stream from the upstream extraction
//! process. The set of kinds is closed — [`Message`] is a tagged union and
//! every consumption point matches exhaustively, so adding a kind is a
//! compile-visible change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable logical identity of one stream: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Source-declared namespace (schema, dataset, ...). Absent for sources
    /// without a namespace concept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Source-declared stream name.
    pub name: String,
}

impl StreamDescriptor {
    /// Creates a descriptor with a namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates a descriptor without a namespace.
    #[must_use]
    pub fn unnamespaced(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One decoded message from the upstream process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A data record destined for one stream's raw table.
    Record(RecordMessage),
    /// A checkpoint marker. Committed downstream only after every preceding
    /// record of the same stream has been reserved and accepted for write.
    Checkpoint(CheckpointMessage),
    /// An out-of-band control signal.
    Control(ControlMessage),
}

/// A single data record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    /// The stream this record belongs to.
    pub stream: StreamDescriptor,
    /// The record payload as declared by the source schema.
    pub data: serde_json::Value,
    /// Source-side emission timestamp, epoch milliseconds.
    pub emitted_at_ms: i64,
    /// Row-level metadata, including upstream-recorded value changes.
    #[serde(default)]
    pub meta: RecordMeta,
}

/// Row-level metadata carried alongside a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Per-value modifications applied anywhere along the pipeline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<RecordChange>,
    /// Identifier of the sync that produced the record, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<i64>,
}

/// One recorded modification of one field of one row.
///
/// A cast failure on the typed-commit safe path produces one of these
/// instead of failing the statement: the value is nulled, the reason is
/// recorded, and the row is still written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    /// The declared field that was modified.
    pub field: String,
    /// What was done to the value.
    pub change: ChangeKind,
    /// Why the value was modified.
    pub reason: ChangeReason,
}

/// What was done to a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The value was replaced with null.
    Nulled,
    /// The value was truncated to fit a destination limit.
    Truncated,
}

/// Why a field's value was modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// The destination could not cast the value to the column type.
    DestinationTypecastError,
    /// The value exceeded a destination size limit.
    DestinationFieldSizeLimitation,
    /// The source could not retrieve the value.
    SourceRetrievalError,
}

/// A checkpoint marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMessage {
    /// The stream this checkpoint covers, or `None` for a global checkpoint
    /// spanning every stream of the sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamDescriptor>,
    /// Opaque source-defined resume state.
    pub state: serde_json::Value,
}

/// Out-of-band control signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The source has emitted every record of the stream.
    StreamComplete {
        /// The completed stream.
        stream: StreamDescriptor,
    },
}

/// A decoded message tagged with its exact serialized byte length.
///
/// The byte length is the unit reserved from the
/// [`ReservationManager`](crate::ingest::ReservationManager) before the
/// message may be buffered.
#[derive(Debug, Clone)]
pub struct SizedMessage {
    /// The decoded message.
    pub message: Message,
    /// Exact on-the-wire size of this message in bytes.
    pub serialized_bytes: u64,
}
