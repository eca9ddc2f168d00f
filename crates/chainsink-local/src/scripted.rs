//! A stream client that replays a fixed list of events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use chainsink_core::{BlockEvent, BlockHandlers, Cursor, SinkError, StreamClient};

/// Decides where a restarted stream picks up.
///
/// Events up to and including the one carrying the start cursor are
/// skipped. A stream that ends without ever seeing the start cursor reports
/// it through [`Resume::finish`].
#[derive(Debug, Clone)]
pub struct Resume {
    start: Option<Cursor>,
    resumed: bool,
}

impl Resume {
    pub fn new(start: Option<Cursor>) -> Self {
        let resumed = start.is_none();
        Self { start, resumed }
    }

    /// Returns `true` if `event` should be delivered.
    pub fn admit(&mut self, event: &BlockEvent) -> bool {
        if self.resumed {
            return true;
        }
        let Some(start) = &self.start else {
            return true;
        };
        if event.cursor() == start {
            self.resumed = true;
        }
        false
    }

    /// Error if the stream ended before reaching the start cursor.
    pub fn finish(&self) -> Result<(), SinkError> {
        match &self.start {
            Some(start) if !self.resumed => Err(SinkError::Stream(format!(
                "start cursor {start} not found in stream"
            ))),
            _ => Ok(()),
        }
    }
}

/// Replays `events` in order.
pub struct ScriptedStream {
    events: Vec<BlockEvent>,
    delay: Option<Duration>,
    follow: bool,
    token: CancellationToken,
}

impl ScriptedStream {
    pub fn new(events: Vec<BlockEvent>) -> Self {
        Self {
            events,
            delay: None,
            follow: false,
            token: CancellationToken::new(),
        }
    }

    /// Pause before each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep `run` open after the last event until shutdown, like a live
    /// stream waiting for the next block.
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl StreamClient for ScriptedStream {
    async fn run(
        &self,
        start: Option<Cursor>,
        handlers: &mut dyn BlockHandlers,
    ) -> Result<(), SinkError> {
        let mut resume = Resume::new(start);
        for event in &self.events {
            if self.token.is_cancelled() {
                tracing::debug!("Scripted stream stopped");
                return Ok(());
            }
            if !resume.admit(event) {
                continue;
            }
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            handlers.handle_event(event.clone()).await?;
        }
        resume.finish()?;

        if self.follow {
            self.token.cancelled().await;
        }
        Ok(())
    }

    fn shutdown(&self, cause: Option<Arc<SinkError>>) {
        if let Some(cause) = &cause {
            tracing::debug!(error = %cause, "Scripted stream shutting down");
        }
        self.token.cancel();
    }
}
