//! Event routing from the framed stream to per-kind consumers.
//!
//! The router is the single consumer of a [`FrameReader`]: each decoded
//! message is reserved against the shared byte budget (records only —
//! checkpoints and controls are transient) and dispatched. Ordering is
//! preserved per stream because routing is strictly sequential: a
//! checkpoint is committed only after every preceding record of the same
//! stream has been accepted by the record sink.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncBufRead;

use crate::error::LoadResult;
use crate::ingest::frame::FrameReader;
use crate::ingest::reservation::{ReservationHandle, ReservationManager};
use crate::message::{
    CheckpointMessage, ControlMessage, Message, RecordMessage, SizedMessage, StreamDescriptor,
};

/// Consumer of data records.
///
/// The sink owns the record's [`ReservationHandle`] and must keep it alive
/// for as long as the record is buffered; dropping the handle returns the
/// bytes to the budget.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Accepts one record for eventual write to its stream's raw table.
    async fn accept(
        &self,
        record: RecordMessage,
        reservation: ReservationHandle,
    ) -> LoadResult<()>;
}

/// Consumer of checkpoint markers.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Commits one checkpoint downstream.
    async fn commit(&self, checkpoint: CheckpointMessage) -> LoadResult<()>;
}

/// Checkpoint sink that collects everything it is given.
#[derive(Debug, Default)]
pub struct CollectingCheckpointSink {
    committed: Mutex<Vec<CheckpointMessage>>,
}

impl CollectingCheckpointSink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoints committed so far, in arrival order.
    #[must_use]
    pub fn committed(&self) -> Vec<CheckpointMessage> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl CheckpointSink for CollectingCheckpointSink {
    async fn commit(&self, checkpoint: CheckpointMessage) -> LoadResult<()> {
        self.committed.lock().push(checkpoint);
        Ok(())
    }
}

/// Per-stream routing bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamBook {
    /// Records routed for this stream.
    pub records: u64,
    /// Serialized bytes routed for this stream.
    pub bytes: u64,
    /// Whether the source declared the stream complete.
    pub complete: bool,
}

/// Totals over one drained stream of messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterSummary {
    /// Records routed.
    pub records: u64,
    /// Serialized record bytes routed.
    pub bytes: u64,
    /// Checkpoints committed.
    pub checkpoints: u64,
    /// Streams the source declared complete.
    pub completed_streams: u64,
}

/// Sequentially dispatches decoded messages to per-kind sinks.
pub struct EventRouter {
    reservations: ReservationManager,
    records: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointSink>,
    books: Mutex<HashMap<StreamDescriptor, StreamBook>>,
    committed: Mutex<u64>,
}

impl EventRouter {
    /// Creates a router over the given budget and sinks.
    pub fn new(
        reservations: ReservationManager,
        records: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointSink>,
    ) -> Self {
        Self {
            reservations,
            records,
            checkpoints,
            books: Mutex::new(HashMap::new()),
            committed: Mutex::new(0),
        }
    }

    /// Routes one message. Suspends on record messages while the byte
    /// budget is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates sink failures; a failing sink fails the drain.
    pub async fn route(&self, sized: SizedMessage) -> LoadResult<()> {
        match sized.message {
            Message::Record(record) => {
                let reservation = self.reservations.reserve(sized.serialized_bytes).await;
                {
                    let mut books = self.books.lock();
                    let book = books.entry(record.stream.clone()).or_insert_with(|| {
                        tracing::info!(stream = %record.stream, "first record for stream");
                        StreamBook::default()
                    });
                    book.records += 1;
                    book.bytes += reservation.bytes();
                }
                self.records.accept(record, reservation).await
            }
            Message::Checkpoint(checkpoint) => {
                self.checkpoints.commit(checkpoint).await?;
                *self.committed.lock() += 1;
                Ok(())
            }
            Message::Control(ControlMessage::StreamComplete { stream }) => {
                tracing::debug!(%stream, "stream complete");
                self.books.lock().entry(stream).or_default().complete = true;
                Ok(())
            }
        }
    }

    /// Drains the reader to end of stream, routing every message.
    ///
    /// # Errors
    ///
    /// Propagates transport and sink failures.
    pub async fn drain<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut FrameReader<R>,
    ) -> LoadResult<RouterSummary> {
        while let Some(sized) = reader.next_message().await? {
            self.route(sized).await?;
        }
        Ok(self.summary())
    }

    /// Bookkeeping for one stream, if any of its messages were seen.
    #[must_use]
    pub fn book(&self, stream: &StreamDescriptor) -> Option<StreamBook> {
        self.books.lock().get(stream).copied()
    }

    /// Totals so far.
    #[must_use]
    pub fn summary(&self) -> RouterSummary {
        let books = self.books.lock();
        RouterSummary {
            records: books.values().map(|b| b.records).sum(),
            bytes: books.values().map(|b| b.bytes).sum(),
            checkpoints: *self.committed.lock(),
            completed_streams: books.values().filter(|b| b.complete).count() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;
    use std::io::Cursor;
    use std::time::Duration;

    /// Record sink that appends an event label and holds reservations
    /// until told to release them.
    #[derive(Default)]
    struct HoldingSink {
        events: Mutex<Vec<String>>,
        held: Mutex<Vec<ReservationHandle>>,
    }

    impl HoldingSink {
        fn release_all(&self) {
            self.held.lock().clear();
        }
    }

    #[async_trait]
    impl RecordSink for HoldingSink {
        async fn accept(
            &self,
            record: RecordMessage,
            reservation: ReservationHandle,
        ) -> LoadResult<()> {
            self.events
                .lock()
                .push(format!("record:{}", record.data["id"]));
            self.held.lock().push(reservation);
            Ok(())
        }
    }

    struct OrderedCheckpointSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CheckpointSink for OrderedCheckpointSink {
        async fn commit(&self, checkpoint: CheckpointMessage) -> LoadResult<()> {
            self.events
                .lock()
                .push(format!("checkpoint:{}", checkpoint.state["cursor"]));
            Ok(())
        }
    }

    fn record(id: i64, bytes: u64) -> SizedMessage {
        SizedMessage {
            message: Message::Record(RecordMessage {
                stream: StreamDescriptor::new("public", "users"),
                data: serde_json::json!({"id": id}),
                emitted_at_ms: id,
                meta: crate::message::RecordMeta::default(),
            }),
            serialized_bytes: bytes,
        }
    }

    fn checkpoint(cursor: i64) -> SizedMessage {
        SizedMessage {
            message: Message::Checkpoint(CheckpointMessage {
                stream: Some(StreamDescriptor::new("public", "users")),
                state: serde_json::json!({"cursor": cursor}),
            }),
            serialized_bytes: 20,
        }
    }

    #[tokio::test]
    async fn test_checkpoint_commits_after_preceding_records() {
        // Share one event log between both sinks to observe interleaving.
        let events = Arc::new(Mutex::new(Vec::new()));
        struct SharedRecordSink {
            events: Arc<Mutex<Vec<String>>>,
        }
        #[async_trait]
        impl RecordSink for SharedRecordSink {
            async fn accept(
                &self,
                record: RecordMessage,
                _reservation: ReservationHandle,
            ) -> LoadResult<()> {
                self.events
                    .lock()
                    .push(format!("record:{}", record.data["id"]));
                Ok(())
            }
        }

        let router = EventRouter::new(
            ReservationManager::new(1024),
            Arc::new(SharedRecordSink {
                events: Arc::clone(&events),
            }),
            Arc::new(OrderedCheckpointSink {
                events: Arc::clone(&events),
            }),
        );

        router.route(record(1, 10)).await.unwrap();
        router.route(record(2, 10)).await.unwrap();
        router.route(checkpoint(42)).await.unwrap();

        assert_eq!(
            *events.lock(),
            vec!["record:1", "record:2", "checkpoint:42"]
        );
        let summary = router.summary();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.checkpoints, 1);
    }

    #[tokio::test]
    async fn test_routing_suspends_when_budget_exhausted() {
        let sink = Arc::new(HoldingSink::default());
        let router = Arc::new(EventRouter::new(
            ReservationManager::new(10),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
            Arc::new(CollectingCheckpointSink::new()),
        ));

        router.route(record(1, 10)).await.unwrap();

        let pending = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.route(record(2, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        sink.release_all();
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("routing should resume after release")
            .unwrap()
            .unwrap();
        assert_eq!(sink.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_complete_marks_book() {
        let router = EventRouter::new(
            ReservationManager::new(1024),
            Arc::new(HoldingSink::default()),
            Arc::new(CollectingCheckpointSink::new()),
        );
        let stream = StreamDescriptor::new("public", "users");

        router.route(record(1, 5)).await.unwrap();
        router
            .route(SizedMessage {
                message: Message::Control(ControlMessage::StreamComplete {
                    stream: stream.clone(),
                }),
                serialized_bytes: 8,
            })
            .await
            .unwrap();

        let book = router.book(&stream).unwrap();
        assert!(book.complete);
        assert_eq!(book.records, 1);
        assert_eq!(router.summary().completed_streams, 1);
    }

    #[tokio::test]
    async fn test_drain_reads_to_end_of_stream() {
        let input = concat!(
            r#"{"type":"record","stream":{"namespace":"public","name":"users"},"data":{"id":1},"emitted_at_ms":1}"#,
            "\n",
            r#"{"type":"checkpoint","state":{"cursor":1}}"#,
            "\n",
            r#"{"type":"control","kind":"stream_complete","stream":{"namespace":"public","name":"users"}}"#,
            "\n",
        );
        let mut reader = FrameReader::new(Cursor::new(input.as_bytes().to_vec()), Framing::Jsonl);

        let checkpoints = Arc::new(CollectingCheckpointSink::new());
        let sink = Arc::new(HoldingSink::default());
        let router = EventRouter::new(
            ReservationManager::new(1024),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
            Arc::clone(&checkpoints) as Arc<dyn CheckpointSink>,
        );
        sink.release_all();

        let summary = router.drain(&mut reader).await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.checkpoints, 1);
        assert_eq!(summary.completed_streams, 1);
        assert_eq!(checkpoints.committed().len(), 1);
    }
}
