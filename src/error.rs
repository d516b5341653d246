//! Error taxonomy for the load engine.
//!
//! Five classes of failure, each with its own enum and a top-level
//! [`LoadError`] umbrella plus the [`LoadResult`] alias:
//!
//! 1. [`ConfigError`] — invalid catalog/naming input; fail fast, never retried
//! 2. [`TransportError`] — the ingestion channel never materialized or broke
//! 3. [`SchemaError`] — unsupported type combination or nesting; aborts one stream
//! 4. [`BackendError`] — destination failures, transient or fatal
//! 5. plain I/O, wrapped unchanged
//!
//! Per-value cast failures are deliberately NOT errors: they are captured as
//! [`RecordChange`](crate::message::RecordChange) entries on the row, which
//! is still written.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::FieldType;

/// Result alias for load-engine operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Top-level error for the load engine.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Invalid catalog or naming input. Fail fast, non-retryable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The ingestion transport failed or never materialized.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An unsupported schema change was requested. Aborts that stream only.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The destination backend reported a failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// An I/O error outside the transport path.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid catalog, naming, or engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declared catalog contains no streams.
    #[error("empty catalog: at least one stream is required")]
    EmptyCatalog,

    /// Two declared fields of one stream map to the same canonical column.
    ///
    /// Canonical-collision resolution across columns is an upstream
    /// precondition; hitting this means the source declared an unloadable
    /// stream.
    #[error(
        "column collision in stream '{stream}': fields '{field}' and '{other}' \
         both canonicalize to '{canonical}'"
    )]
    ColumnCollision {
        /// The offending stream, rendered as `namespace.name`.
        stream: String,
        /// The first declared field.
        field: String,
        /// The colliding field.
        other: String,
        /// The shared canonical column name.
        canonical: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The ingestion transport failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The interprocess channel never materialized within the hard deadline.
    #[error("channel at '{path}' did not materialize within {timeout_ms} ms")]
    Timeout {
        /// Path of the channel that was polled.
        path: PathBuf,
        /// The configured hard deadline.
        timeout_ms: u64,
    },

    /// A length-prefixed frame ended before its declared size.
    #[error("truncated frame: declared {declared} bytes, got {got}")]
    TruncatedFrame {
        /// Bytes declared by the length prefix.
        declared: u64,
        /// Bytes actually read before EOF.
        got: u64,
    },

    /// A length-prefixed frame carried an undecodable payload.
    ///
    /// Binary framing implies a machine-written channel, so a bad payload
    /// means corruption rather than log noise and is fatal.
    #[error("undecodable frame: {0}")]
    Decode(String),

    /// I/O failure on the underlying byte stream.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// An unsupported schema change or type combination.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No lossless common type exists for the pair.
    #[error("no supertype for {left:?} and {right:?}")]
    NoSuperType {
        /// Existing column type.
        left: FieldType,
        /// Incoming column type.
        right: FieldType,
    },

    /// The type never participates in promotion, regardless of the other side.
    #[error("type {0:?} does not support promotion")]
    PromotionDisallowed(FieldType),

    /// A declared column nests deeper than the supported single level.
    #[error("column '{column}' nests {depth} levels deep; at most one level is supported")]
    NestingTooDeep {
        /// The offending column.
        column: String,
        /// Measured nesting depth.
        depth: usize,
    },
}

/// A failure reported by the destination backend.
///
/// Retryability is NOT decided here: the per-backend
/// [`StatementGenerator`](crate::backend::StatementGenerator) supplies the
/// predicate, because only the backend knows which of its failures a safe
/// re-run can absorb.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A statement failed to execute.
    #[error("statement failed: {message}")]
    Statement {
        /// Backend-reported failure message.
        message: String,
        /// Backend-supplied hint consumed by the generator's retryability
        /// predicate; never inspected by the core engine directly.
        retryable: bool,
    },

    /// An operation referenced a table the destination does not have.
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// The persisted per-stream state blob could not be read or written.
    #[error("destination state error: {0}")]
    State(String),
}
