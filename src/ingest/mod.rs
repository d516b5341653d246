//! Bounded-memory ingestion channel.
//!
//! Three pieces: [`frame`] opens the transport and decodes framed
//! messages with exact byte sizes, [`reservation`] enforces the shared
//! byte budget, and [`router`] dispatches decoded messages to per-kind
//! sinks under that budget.

pub mod frame;
pub mod reservation;
pub mod router;

pub use frame::{open_transport, FrameReader};
pub use reservation::{ReservationHandle, ReservationManager};
pub use router::{
    CheckpointSink, CollectingCheckpointSink, EventRouter, RecordSink, RouterSummary, StreamBook,
};
