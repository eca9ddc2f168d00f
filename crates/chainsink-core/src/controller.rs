//! Pipeline controller: drives one sink from start to stop.
//!
//! # Per event
//! 1. Map the event to its publish batch
//! 2. Publish the batch and wait for every acknowledgment
//! 3. Save the event's cursor
//!
//! Any failure stops the sink before step 3, so the saved cursor always
//! points at the last fully published batch.
//!
//! # Shutdown
//! The controller and the stream client stop each other: a handler error or
//! an external [`Lifecycle::shutdown`] asks the stream to stop, and the stream
//! returning from `run` shuts the lifecycle down. After shutdown is requested
//! the stream gets `shutdown_timeout` to unwind.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{Instrument, Span};

use crate::config::{SinkConfig, SinkState};
use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::handler::{BlockHandlers, StreamClient};
use crate::lifecycle::Lifecycle;
use crate::mapper::MessageMapper;
use crate::publisher::{DestinationResolver, FanoutPublisher, Publisher};
use crate::store::CursorStore;
use crate::types::{BlockScopedData, BlockUndoSignal, OutboundMessage};

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    /// Data events fully handled.
    pub blocks: u64,
    /// Undo signals fully handled.
    pub undos: u64,
    /// Messages acknowledged by the broker.
    pub messages: u64,
    /// Last cursor saved during this run.
    pub last_cursor: Option<Cursor>,
}

/// Handler side of the controller: map, publish, save.
struct Pipeline {
    mapper: MessageMapper,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn CursorStore>,
    lifecycle: Lifecycle,
    summary: SinkSummary,
}

impl Pipeline {
    async fn commit(&mut self, batch: Vec<OutboundMessage>, cursor: Cursor) -> Result<(), SinkError> {
        let report = match self.publisher.publish(&batch).await {
            Ok(report) => report,
            Err(e) if e.is_shutdown() => return Err(SinkError::shutdown(self.lifecycle.cause())),
            Err(e) => return Err(e),
        };

        // A shutdown that raced the acknowledgments still wins: nothing is
        // saved once termination started.
        if self.lifecycle.is_terminating() {
            return Err(SinkError::shutdown(self.lifecycle.cause()));
        }

        self.store.save(&cursor).await?;

        self.summary.messages += report.published as u64;
        self.summary.last_cursor = Some(cursor);
        Ok(())
    }

    /// Record a handler failure as the shutdown cause, then hand it back.
    fn fail(&self, err: SinkError) -> SinkError {
        if !err.is_shutdown() {
            tracing::error!(error = %err, "Handler failed; shutting down");
            self.lifecycle.shutdown(Some(Arc::new(err.clone())));
        }
        err
    }
}

#[async_trait]
impl BlockHandlers for Pipeline {
    async fn handle_block_scoped_data(&mut self, data: BlockScopedData) -> Result<(), SinkError> {
        let block = data.clock.number;
        let result = match self.mapper.map_data_event(&data.payload, &data.cursor, block) {
            Ok(batch) => {
                let messages = batch.len();
                tracing::debug!(block, messages, is_live = ?data.is_live, "Block mapped");
                self.commit(batch, data.cursor.clone()).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.summary.blocks += 1;
                tracing::info!(block, cursor = %data.cursor, "Block published");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn handle_block_undo_signal(&mut self, signal: BlockUndoSignal) -> Result<(), SinkError> {
        let last_valid = signal.last_valid_block.number;
        tracing::warn!(last_valid_block = %signal.last_valid_block, "Undo signal received");

        let batch = self.mapper.map_undo_event(last_valid, &signal.cursor);
        match self.commit(batch, signal.cursor.clone()).await {
            Ok(()) => {
                self.summary.undos += 1;
                tracing::info!(last_valid, cursor = %signal.cursor, "Undo published");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }
}

/// Owns the stream, the pipeline and the shutdown wiring for one sink.
pub struct Controller {
    config: SinkConfig,
    stream: Arc<dyn StreamClient>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn CursorStore>,
    lifecycle: Lifecycle,
    state: watch::Sender<SinkState>,
    span: Span,
}

impl Controller {
    pub fn new(
        config: SinkConfig,
        stream: Arc<dyn StreamClient>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn CursorStore>,
    ) -> Self {
        let span = tracing::info_span!("sink", id = %config.id);
        let (state, _) = watch::channel(SinkState::Idle);
        Self {
            config,
            stream,
            publisher,
            store,
            lifecycle: Lifecycle::new(),
            state,
            span,
        }
    }

    /// Wire a [`FanoutPublisher`] over `resolver`, cancelled with this
    /// controller's lifecycle.
    pub fn with_resolver<R>(
        config: SinkConfig,
        stream: Arc<dyn StreamClient>,
        resolver: R,
        store: Arc<dyn CursorStore>,
    ) -> Self
    where
        R: DestinationResolver + 'static,
    {
        let lifecycle = Lifecycle::new();
        let span = tracing::info_span!("sink", id = %config.id);
        let publisher = FanoutPublisher::new(resolver)
            .with_cancellation(lifecycle.token())
            .with_span(tracing::debug_span!(parent: &span, "publish"));
        Self::new(config, stream, Arc::new(publisher), store)
            .with_lifecycle(lifecycle)
            .with_span(span)
    }

    /// Share an existing lifecycle (e.g. one the publisher is cancelled by).
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Span the sink logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Handle for requesting shutdown from outside (signals, parent tasks).
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SinkState) {
        self.state.send_replace(state);
        tracing::debug!(parent: &self.span, %state, "Sink state changed");
    }

    /// Run until the stream ends, a handler fails, or shutdown is requested.
    ///
    /// A requested shutdown without a cause ends cleanly (`Ok`); everything
    /// else returns the first fatal error.
    pub async fn run(&mut self) -> Result<SinkSummary, SinkError> {
        let span = self.span.clone();
        let result = self.run_inner().instrument(span.clone()).await;
        self.set_state(SinkState::Stopped);
        match &result {
            Ok(summary) => tracing::info!(
                parent: &span,
                blocks = summary.blocks,
                undos = summary.undos,
                messages = summary.messages,
                last_cursor = ?summary.last_cursor.as_ref().map(|c| c.to_string()),
                "Sink stopped"
            ),
            Err(e) => tracing::error!(parent: &span, error = %e, "Sink stopped with error"),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<SinkSummary, SinkError> {
        if self.state() != SinkState::Idle {
            return Err(SinkError::Stream(format!(
                "controller already {}",
                self.state()
            )));
        }

        let start = match self.store.load().await {
            Ok(start) => start,
            Err(e) => {
                self.lifecycle.shutdown(Some(Arc::new(e.clone())));
                return Err(e);
            }
        };
        match &start {
            Some(cursor) => tracing::info!(restarting_at = %cursor.block(), cursor = %cursor, "Starting sink"),
            None => tracing::info!("Starting sink from the stream's start block"),
        }

        let stream = self.stream.clone();
        self.lifecycle.on_terminating(move |cause| stream.shutdown(cause));

        let mut pipeline = Pipeline {
            mapper: self.config.mapper(),
            publisher: self.publisher.clone(),
            store: self.store.clone(),
            lifecycle: self.lifecycle.clone(),
            summary: SinkSummary::default(),
        };

        self.set_state(SinkState::Running);
        let outcome = {
            let run = self.stream.run(start, &mut pipeline);
            tokio::pin!(run);
            tokio::select! {
                biased;
                res = &mut run => res,
                _ = self.lifecycle.terminated() => {
                    self.state.send_replace(SinkState::Terminating);
                    let timeout = self.config.shutdown_timeout();
                    match tokio::time::timeout(timeout, &mut run).await {
                        Ok(res) => res,
                        Err(_) => {
                            tracing::warn!(timeout_ms = self.config.shutdown_timeout_ms, "Stream did not stop in time; abandoning it");
                            match self.lifecycle.cause() {
                                Some(cause) => Err(SinkError::shutdown(Some(cause))),
                                None => Err(SinkError::Stream(format!(
                                    "stream did not stop within {}ms of shutdown",
                                    self.config.shutdown_timeout_ms
                                ))),
                            }
                        }
                    }
                }
            }
        };

        self.set_state(SinkState::Terminating);
        let summary = std::mem::take(&mut pipeline.summary);
        match outcome {
            Ok(()) => {
                self.lifecycle.shutdown(None);
                match self.lifecycle.cause() {
                    Some(cause) => Err(SinkError::shutdown(Some(cause))),
                    None => Ok(summary),
                }
            }
            Err(e) if e.is_shutdown() => match self.lifecycle.cause() {
                Some(cause) => Err(SinkError::shutdown(Some(cause))),
                None => {
                    self.lifecycle.shutdown(None);
                    Ok(summary)
                }
            },
            Err(e) => {
                self.lifecycle.shutdown(Some(Arc::new(e.clone())));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{Destination, DestinationConfig, PublishResult, StaticResolver};
    use crate::store::MemoryCursorStore;
    use crate::types::{BlockEvent, BlockRef};
    use crate::wire::{PublishMessage, PublishOperations};
    use crate::BrokerError;
    use bytes::Bytes;
    use prost::Message;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed list of events.
    struct Script {
        events: Vec<BlockEvent>,
        stopped: AtomicBool,
    }

    impl Script {
        fn new(events: Vec<BlockEvent>) -> Arc<Self> {
            Arc::new(Self {
                events,
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl StreamClient for Script {
        async fn run(
            &self,
            start: Option<Cursor>,
            handlers: &mut dyn BlockHandlers,
        ) -> Result<(), SinkError> {
            for event in self.events.clone() {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(start) = &start {
                    if event.cursor() <= start {
                        continue;
                    }
                }
                handlers.handle_event(event).await?;
            }
            Ok(())
        }

        fn shutdown(&self, _cause: Option<Arc<SinkError>>) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Topic {
        seen: Mutex<Vec<OutboundMessage>>,
        fail_block: Option<u64>,
    }

    impl Destination for Topic {
        fn publish(&self, message: OutboundMessage) -> PublishResult {
            let failed = self.fail_block.is_some_and(|b| {
                message
                    .ordering_key
                    .as_deref()
                    .is_some_and(|k| k.starts_with(&format!("{b:09}_")))
            });
            self.seen.lock().unwrap().push(message);
            if failed {
                PublishResult::ready(Err(BrokerError::new("unavailable")))
            } else {
                PublishResult::ready(Ok("id".into()))
            }
        }
    }

    fn cursor(n: u64) -> Cursor {
        Cursor::new(BlockRef::new(n, format!("0x{n:x}")), BlockRef::new(n.saturating_sub(5), "0xf"))
    }

    fn data(n: u64, bodies: &[&str]) -> BlockEvent {
        let ops = PublishOperations {
            messages: bodies.iter().map(|b| PublishMessage::new(b.as_bytes().to_vec())).collect(),
        };
        BlockEvent::Data(BlockScopedData {
            clock: BlockRef::new(n, format!("0x{n:x}")),
            payload: Bytes::from(ops.encode_to_vec()),
            cursor: cursor(n),
            is_live: Some(false),
        })
    }

    fn config() -> SinkConfig {
        crate::SinkBuilder::new().topic("topic").build_config()
    }

    fn controller(
        events: Vec<BlockEvent>,
        topic: Arc<Topic>,
        store: Arc<MemoryCursorStore>,
    ) -> Controller {
        let resolver = StaticResolver::new().register(DestinationConfig::ordered("topic"), topic);
        Controller::with_resolver(config(), Script::new(events), resolver, store)
    }

    #[tokio::test]
    async fn publishes_then_saves_each_block() {
        let topic = Arc::new(Topic::default());
        let store = Arc::new(MemoryCursorStore::new());
        let mut ctl = controller(vec![data(1, &["a"]), data(2, &["b", "c"])], topic.clone(), store.clone());

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.last_cursor, Some(cursor(2)));
        assert_eq!(store.load().await.unwrap(), Some(cursor(2)));
        assert_eq!(store.save_count(), 2);
        assert_eq!(ctl.state(), SinkState::Stopped);
        assert_eq!(topic.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_publish_keeps_previous_cursor() {
        let topic = Arc::new(Topic {
            fail_block: Some(2),
            ..Default::default()
        });
        let store = Arc::new(MemoryCursorStore::new());
        let mut ctl = controller(
            vec![data(1, &["a"]), data(2, &["b"]), data(3, &["c"])],
            topic.clone(),
            store.clone(),
        );

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, SinkError::Publish(_)), "got {err:?}");
        assert_eq!(store.load().await.unwrap(), Some(cursor(1)));
        assert!(ctl.lifecycle().is_terminating());
        // Block 3 never reached the broker.
        assert_eq!(topic.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_destination_stops_before_save() {
        let topic = Arc::new(Topic::default());
        let store = Arc::new(MemoryCursorStore::with_cursor(cursor(0)));
        let ops = PublishOperations {
            messages: vec![
                PublishMessage::new(b"1".to_vec()),
                PublishMessage::new(b"2".to_vec()).topic("nowhere"),
                PublishMessage::new(b"3".to_vec()),
            ],
        };
        let event = BlockEvent::Data(BlockScopedData {
            clock: BlockRef::new(7, "0x7"),
            payload: Bytes::from(ops.encode_to_vec()),
            cursor: cursor(7),
            is_live: None,
        });
        let mut ctl = controller(vec![event], topic, store.clone());

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, SinkError::UnknownDestination { index: 1, .. }));
        assert_eq!(store.load().await.unwrap(), Some(cursor(0)));
    }

    #[tokio::test]
    async fn undo_emits_marker_and_advances_cursor() {
        let topic = Arc::new(Topic::default());
        let store = Arc::new(MemoryCursorStore::new());
        let undo_cursor = Cursor::undo(BlockRef::new(10, "0xa"), BlockRef::new(5, "0xf"));
        let events = vec![
            data(14, &["x"]),
            data(15, &["y"]),
            BlockEvent::Undo(BlockUndoSignal {
                last_valid_block: BlockRef::new(10, "0xa"),
                cursor: undo_cursor.clone(),
            }),
        ];
        let mut ctl = controller(events, topic.clone(), store.clone());

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.undos, 1);

        let seen = topic.seen.lock().unwrap();
        let marker = seen.last().unwrap();
        assert_eq!(marker.attribute("LastValidBlock"), Some("10"));
        assert_eq!(marker.attribute("Step"), Some("Undo"));
        assert_eq!(marker.attribute("cursor"), Some(undo_cursor.to_string().as_str()));
        assert_eq!(store.load().await.unwrap(), Some(undo_cursor));
    }

    #[tokio::test]
    async fn decode_error_is_fatal() {
        let store = Arc::new(MemoryCursorStore::new());
        let bad = BlockEvent::Data(BlockScopedData {
            clock: BlockRef::new(3, "0x3"),
            payload: Bytes::from_static(&[0xff, 0xff]),
            cursor: cursor(3),
            is_live: None,
        });
        let mut ctl = controller(vec![bad], Arc::new(Topic::default()), store.clone());

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, SinkError::Decode { block_number: 3, .. }));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_resumes_after_saved_cursor() {
        let topic = Arc::new(Topic::default());
        let store = Arc::new(MemoryCursorStore::with_cursor(cursor(2)));
        let events = vec![data(1, &["a"]), data(2, &["b"]), data(3, &["c"])];
        let mut ctl = controller(events, topic.clone(), store.clone());

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.blocks, 1);
        let seen = topic.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].body[..], b"c");
    }

    #[tokio::test]
    async fn shutdown_before_run_publishes_nothing() {
        let topic = Arc::new(Topic::default());
        let store = Arc::new(MemoryCursorStore::new());
        let mut ctl = controller(vec![data(1, &["a"])], topic.clone(), store.clone());
        ctl.lifecycle().shutdown(None);

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary, SinkSummary::default());
        assert!(store.load().await.unwrap().is_none());
        assert!(topic.seen.lock().unwrap().is_empty());
    }

    /// Loads nothing and fails every save.
    struct DiskFull;

    #[async_trait]
    impl CursorStore for DiskFull {
        async fn load(&self) -> Result<Option<Cursor>, SinkError> {
            Ok(None)
        }

        async fn save(&self, _cursor: &Cursor) -> Result<(), SinkError> {
            Err(SinkError::io(
                "saving",
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ))
        }

        async fn clear(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn save_failure_after_publish_is_fatal() {
        let topic = Arc::new(Topic::default());
        let script = Script::new(vec![data(1, &["a"]), data(2, &["b"])]);
        let resolver = StaticResolver::new().register(DestinationConfig::ordered("topic"), topic.clone());
        let mut ctl = Controller::with_resolver(config(), script.clone(), resolver, Arc::new(DiskFull));

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }), "got {err:?}");
        assert!(script.stopped.load(Ordering::SeqCst));
        assert!(matches!(ctl.lifecycle().cause().as_deref(), Some(SinkError::Io { .. })));
        // Block 1 was published; block 2 never reached the broker.
        assert_eq!(topic.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut ctl = controller(vec![], Arc::new(Topic::default()), store);
        ctl.run().await.unwrap();
        assert!(ctl.run().await.is_err());
    }
}
