//! Transport setup and message framing.
//!
//! [`open_transport`] turns a [`TransportConfig`] into a buffered byte
//! stream, polling a pipe path until it materializes (bounded by the
//! configured hard deadline). [`FrameReader`] then decodes that stream
//! into [`SizedMessage`]s under either framing.
//!
//! The two framings fail differently on bad input: a JSONL line that does
//! not decode is operator-visible noise (a warning from the source
//! process, a stray log line) and is skipped with a debug log, while a
//! length-prefixed frame that does not decode means a corrupted
//! machine-written channel and is fatal.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::config::{Framing, TransportConfig};
use crate::error::{LoadResult, TransportError};
use crate::message::{Message, SizedMessage};

/// Opens the configured transport as a buffered byte stream.
///
/// For [`TransportConfig::Pipe`], the path is polled at the configured
/// interval until it exists, up to the hard deadline.
///
/// # Errors
///
/// [`TransportError::Timeout`] if a pipe path never materializes, or the
/// underlying I/O error from opening it.
pub async fn open_transport(
    config: &TransportConfig,
) -> Result<Box<dyn AsyncBufRead + Send + Unpin>, TransportError> {
    match config {
        TransportConfig::Stdin => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        TransportConfig::Pipe {
            path,
            poll_interval_ms,
            timeout_ms,
        } => {
            let deadline = Instant::now() + Duration::from_millis(*timeout_ms);
            loop {
                if tokio::fs::metadata(path).await.is_ok() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout {
                        path: path.clone(),
                        timeout_ms: *timeout_ms,
                    });
                }
                tracing::debug!(path = %path.display(), "waiting for channel to appear");
                tokio::time::sleep_until(
                    deadline.min(Instant::now() + Duration::from_millis(*poll_interval_ms)),
                )
                .await;
            }
            let file = File::open(path).await?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

/// Decodes framed messages from a byte stream, tagging each with its
/// exact serialized size.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Wraps a byte stream with the given framing.
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader,
            framing,
            skipped: 0,
        }
    }

    /// Lines skipped because they did not decode (JSONL only).
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Reads the next message, or `None` at clean end of stream.
    ///
    /// # Errors
    ///
    /// I/O failures always propagate. Under JSONL framing, undecodable
    /// lines are skipped; under length-prefixed framing, a truncated or
    /// undecodable frame is a [`TransportError`].
    pub async fn next_message(&mut self) -> LoadResult<Option<SizedMessage>> {
        match self.framing {
            Framing::Jsonl => self.next_jsonl().await,
            Framing::LengthPrefixed => self.next_prefixed().await,
        }
    }

    async fn next_jsonl(&mut self) -> LoadResult<Option<SizedMessage>> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(TransportError::Io)?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = trim_line(&line);
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Message>(trimmed) {
                Ok(message) => {
                    // Size includes the delimiter: it is the byte-offset
                    // delta between successive parses.
                    return Ok(Some(SizedMessage {
                        message,
                        serialized_bytes: read as u64,
                    }));
                }
                Err(error) => {
                    self.skipped += 1;
                    tracing::debug!(%error, bytes = read, "skipping undecodable line");
                }
            }
        }
    }

    async fn next_prefixed(&mut self) -> LoadResult<Option<SizedMessage>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let read = self
                .reader
                .read(&mut prefix[filled..])
                .await
                .map_err(TransportError::Io)?;
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::TruncatedFrame {
                    declared: prefix.len() as u64,
                    got: filled as u64,
                }
                .into());
            }
            filled += read;
        }

        let declared = u64::from(u32::from_be_bytes(prefix));
        let mut payload = vec![0u8; usize::try_from(declared).unwrap_or(usize::MAX)];
        let mut got = 0;
        while got < payload.len() {
            let read = self
                .reader
                .read(&mut payload[got..])
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => TransportError::TruncatedFrame {
                        declared,
                        got: got as u64,
                    },
                    _ => TransportError::Io(e),
                })?;
            if read == 0 {
                return Err(TransportError::TruncatedFrame {
                    declared,
                    got: got as u64,
                }
                .into());
            }
            got += read;
        }

        let message = serde_json::from_slice::<Message>(&payload)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(Some(SizedMessage {
            message,
            serialized_bytes: declared,
        }))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
