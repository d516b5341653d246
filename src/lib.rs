//! # Riverbed
//!
//! Destination-side bulk loading engine for data-integration syncs.
//!
//! Riverbed reads a framed message stream from an upstream extraction
//! process, buffers it under a shared byte budget, lands records in raw
//! tables, and commits them to typed, deduplicated final tables — with
//! schema evolution, per-stream migrations, and rebuild-and-swap soft
//! resets along the way. Destination specifics live behind the
//! [`backend::Backend`] and [`backend::StatementGenerator`] seams; an
//! in-memory pair is included for testing and development.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Destination backend seams and the in-memory implementation
pub mod backend;

/// Table and column naming catalog
pub mod catalog;

/// Typed-commit execution, soft resets, overwrite swaps
pub mod commit;

/// Engine and stream configuration
pub mod config;

/// Error taxonomy
pub mod error;

/// Bounded-memory ingestion channel
pub mod ingest;

/// Wire message model
pub mod message;

/// Per-stream migration orchestration
pub mod migrate;

/// End-to-end sync pipeline
pub mod pipeline;

/// Schema reconciliation engine
pub mod schema;

/// Initial destination status gathering
pub mod status;

/// Type system and supertype promotion
pub mod types;

pub use config::{DestinationCatalog, LoadConfig, StreamConfig, SyncMode};
pub use error::{LoadError, LoadResult};
pub use message::{Message, StreamDescriptor};
pub use pipeline::{LoadPipeline, LoadReport};
