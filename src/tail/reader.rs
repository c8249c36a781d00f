use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::remote::{commands, CommandChannel};

/// A contiguous byte range read from a remote file
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
    pub bytes: Vec<u8>,
}

/// Why a range read stopped before reaching its requested end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    Channel(String),
    ExitStatus { status: i32, stderr: String },
    /// The remote returned fewer bytes than asked for (file shrank or was swapped)
    ShortRead { expected: u64, received: u64 },
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFailure::Channel(e) => write!(f, "range read failed: {}", e),
            ReadFailure::ExitStatus { status, stderr } => {
                write!(f, "range read exited with status {}: {}", status, stderr)
            }
            ReadFailure::ShortRead { expected, received } => {
                write!(f, "short read: expected {} bytes, got {}", expected, received)
            }
        }
    }
}

/// Reads `[start, end)` of a remote file in chunks of at most `max_chunk_bytes`.
///
/// Chunks are produced one remote invocation at a time, in order, as the
/// caller pulls them. The first failed or short invocation ends the sequence;
/// the bytes delivered so far remain valid.
pub struct ChunkedRangeReader {
    channel: Arc<dyn CommandChannel>,
    retry: RetryPolicy,
    timeout: Duration,
    path: String,
    start: u64,
    cursor: u64,
    end: u64,
    max_chunk_bytes: u64,
    done: bool,
    failure: Option<ReadFailure>,
}

impl ChunkedRangeReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        retry: RetryPolicy,
        timeout: Duration,
        path: &str,
        start: u64,
        end: u64,
        max_chunk_bytes: u64,
    ) -> Self {
        Self {
            channel,
            retry,
            timeout,
            path: path.to_string(),
            start,
            cursor: start,
            end,
            max_chunk_bytes: max_chunk_bytes.max(1),
            done: false,
            failure: None,
        }
    }

    /// Fetch the next chunk, or `None` once the range is exhausted or a read failed
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        if self.done || self.cursor >= self.end {
            self.done = true;
            return None;
        }

        let length = std::cmp::min(self.max_chunk_bytes, self.end - self.cursor);
        let command = commands::range_read(&self.path, self.cursor, length);

        let output = match self
            .retry
            .execute(self.channel.as_ref(), &command, self.timeout)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.stop(ReadFailure::Channel(e.to_string()));
                return None;
            }
        };

        if !output.success() {
            let stderr = output.stderr_lossy();
            self.stop(ReadFailure::ExitStatus {
                status: output.status,
                stderr,
            });
            return None;
        }

        let mut bytes = output.stdout;
        bytes.truncate(length as usize);
        let received = bytes.len() as u64;

        if received < length {
            self.stop(ReadFailure::ShortRead {
                expected: length,
                received,
            });
        }

        if received == 0 {
            return None;
        }

        let chunk = Chunk {
            offset: self.cursor,
            length: received,
            bytes,
        };
        self.cursor += received;
        Some(chunk)
    }

    /// Bytes delivered so far
    pub fn bytes_read(&self) -> u64 {
        self.cursor - self.start
    }

    pub fn failure(&self) -> Option<&ReadFailure> {
        self.failure.as_ref()
    }

    fn stop(&mut self, failure: ReadFailure) {
        tracing::debug!(path = %self.path, offset = self.cursor, %failure, "Range read stopped early");
        self.failure = Some(failure);
        self.done = true;
    }
}
