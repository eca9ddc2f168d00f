//! A stream client that replays block events recorded in a JSON-lines file.
//!
//! One record per line, either
//!
//! ```json
//! {"data":{"clock":{"number":12,"id":"0xab"},"final_block":{"number":8,"id":"0x12"},"payload":"0a04...","module":"map_transfers"}}
//! {"undo":{"last_valid_block":{"number":10,"id":"0x10"},"final_block":{"number":8,"id":"0x12"}}}
//! ```
//!
//! `payload` is the hex-encoded `PublishOperations` message. Undo records
//! carry undo cursors (`...:undo`). Blank lines and lines starting with `#`
//! are ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use chainsink_core::{
    BlockEvent, BlockHandlers, BlockRef, BlockScopedData, BlockUndoSignal, Cursor, SinkError,
    StreamClient,
};

use crate::range::BlockRange;
use crate::scripted::Resume;

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayRecord {
    Data {
        clock: BlockRef,
        final_block: BlockRef,
        /// Hex, with or without `0x`.
        payload: String,
        /// Output module that produced the payload; `None` matches any filter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_live: Option<bool>,
    },
    Undo {
        last_valid_block: BlockRef,
        final_block: BlockRef,
    },
}

impl ReplayRecord {
    /// A data record for `payload`.
    pub fn data(clock: BlockRef, final_block: BlockRef, payload: &[u8]) -> Self {
        Self::Data {
            clock,
            final_block,
            payload: hex::encode(payload),
            module: None,
            is_live: None,
        }
    }

    pub fn undo(last_valid_block: BlockRef, final_block: BlockRef) -> Self {
        Self::Undo {
            last_valid_block,
            final_block,
        }
    }

    /// The output module, for data records that name one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Data { module, .. } => module.as_deref(),
            Self::Undo { .. } => None,
        }
    }

    /// Convert to the event the handlers see.
    pub fn into_event(self) -> Result<BlockEvent, String> {
        match self {
            Self::Data {
                clock,
                final_block,
                payload,
                is_live,
                ..
            } => {
                let payload = hex::decode(payload.trim_start_matches("0x"))
                    .map_err(|e| format!("payload is not hex: {e}"))?;
                let cursor = Cursor::try_new(clock.clone(), final_block)
                    .map_err(|e| e.reason.to_string())?;
                Ok(BlockEvent::Data(BlockScopedData {
                    clock,
                    payload: Bytes::from(payload),
                    cursor,
                    is_live,
                }))
            }
            Self::Undo {
                last_valid_block,
                final_block,
            } => {
                let cursor = Cursor::undo(last_valid_block.clone(), final_block);
                cursor.validate().map_err(|e| e.reason.to_string())?;
                Ok(BlockEvent::Undo(BlockUndoSignal {
                    last_valid_block,
                    cursor,
                }))
            }
        }
    }
}

/// Replays a recorded file through the handlers.
pub struct ReplayStream {
    path: PathBuf,
    module: Option<String>,
    range: BlockRange,
    delay: Option<Duration>,
    token: CancellationToken,
}

impl ReplayStream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            module: None,
            range: BlockRange::unbounded(),
            delay: None,
            token: CancellationToken::new(),
        }
    }

    /// Only deliver data records produced by `module`.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_range(mut self, range: BlockRange) -> Self {
        self.range = range;
        self
    }

    /// Pause before each delivered event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wants(&self, record: &ReplayRecord) -> bool {
        match record {
            ReplayRecord::Data { clock, .. } => {
                let module_ok = match (&self.module, record.module()) {
                    (Some(want), Some(got)) => want == got,
                    _ => true,
                };
                module_ok && self.range.contains(clock.number)
            }
            ReplayRecord::Undo { .. } => true,
        }
    }

    fn line_error(&self, line: usize, reason: impl std::fmt::Display) -> SinkError {
        SinkError::Stream(format!("{}:{line}: {reason}", self.path.display()))
    }
}

#[async_trait]
impl StreamClient for ReplayStream {
    async fn run(
        &self,
        start: Option<Cursor>,
        handlers: &mut dyn BlockHandlers,
    ) -> Result<(), SinkError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| SinkError::io(format!("opening replay file {}", self.path.display()), e))?;
        let mut lines = BufReader::new(file).lines();
        let mut resume = Resume::new(start);
        let mut line_no = 0usize;

        tracing::info!(path = %self.path.display(), range = %self.range, module = ?self.module, "Replaying");

        loop {
            let line = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                line = lines.next_line() => line.map_err(|e| {
                    SinkError::io(format!("reading replay file {}", self.path.display()), e)
                })?,
            };
            let Some(line) = line else {
                tracing::info!(lines = line_no, "Replay file exhausted");
                return resume.finish();
            };
            line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record: ReplayRecord =
                serde_json::from_str(trimmed).map_err(|e| self.line_error(line_no, e))?;

            if let ReplayRecord::Data { clock, .. } = &record {
                if self.range.is_past_end(clock.number) {
                    tracing::info!(block = clock.number, "Reached end of block range");
                    return Ok(());
                }
            }
            if !self.wants(&record) {
                continue;
            }

            let event = record.into_event().map_err(|e| self.line_error(line_no, e))?;
            if !resume.admit(&event) {
                continue;
            }

            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            handlers.handle_event(event).await?;
        }
    }

    fn shutdown(&self, _cause: Option<Arc<SinkError>>) {
        self.token.cancel();
    }
}
