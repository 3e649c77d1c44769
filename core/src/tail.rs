//! Poll-based tail of a command's log file.
//!
//! The tail has no iteration cap: a command that is never finalized keeps
//! it polling forever. Callers wiring it into a request boundary must
//! impose their own timeout or drop the stream.

use std::time::Duration;

use futures::Stream;

use crate::error::Result;
use crate::store::CommandStore;
use crate::transport::SandboxConnector;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailPoll {
    /// Bytes appended since the previous poll, if any.
    pub chunk: Option<Vec<u8>>,
    /// The command record is terminal; no further polls are needed.
    pub finished: bool,
}

/// Incremental reader over `logs.ndjson` with a monotonic byte cursor.
pub struct LogTail<C: SandboxConnector> {
    store: CommandStore<C>,
    sandbox_id: String,
    cmd_id: String,
    cursor: usize,
    interval: Duration,
}

impl<C: SandboxConnector> LogTail<C> {
    /// Creates a tail for one command.
    pub fn new(store: CommandStore<C>, sandbox_id: impl Into<String>, cmd_id: impl Into<String>) -> Self {
        Self {
            store,
            sandbox_id: sandbox_id.into(),
            cmd_id: cmd_id.into(),
            cursor: 0,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of bytes already emitted.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Reads metadata then logs once, returning any bytes past the cursor.
    ///
    /// The cursor never rewinds: if the log shrinks, nothing is emitted
    /// until it grows past the previous length.
    pub async fn poll_once(&mut self) -> Result<TailPoll> {
        let meta = self.store.read_meta(&self.sandbox_id, &self.cmd_id).await?;
        let logs = self.store.read_logs(&self.sandbox_id, &self.cmd_id).await?;

        let chunk = match logs {
            Some(logs) if logs.len() > self.cursor => {
                let chunk = logs.as_bytes()[self.cursor..].to_vec();
                self.cursor = logs.len();
                Some(chunk)
            }
            _ => None,
        };

        Ok(TailPoll {
            chunk,
            finished: meta.map(|m| m.is_terminal()).unwrap_or(false),
        })
    }

    /// Polls until the command is terminal, yielding each new chunk.
    ///
    /// A storage or connection error is yielded once and ends the stream.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Vec<u8>>> {
        async_stream::stream! {
            loop {
                match self.poll_once().await {
                    Ok(poll) => {
                        if let Some(chunk) = poll.chunk {
                            yield Ok(chunk);
                        }
                        if poll.finished {
                            tracing::debug!(
                                sandbox_id = %self.sandbox_id,
                                cmd_id = %self.cmd_id,
                                bytes = self.cursor,
                                "log tail finished"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        }
    }
}
